//! Dashboard read side: cursor polling and the SSE push stream.

use axum::{
    Json,
    extract::{Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
};
use dirsub_core::api::FeedQuery;
use dirsub_core::{FeedPage, JobEvent, JobView, ProgressFeed};
use std::{collections::BTreeSet, convert::Infallible, pin::Pin, time::Duration};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::errors::AppResult;
use crate::state::AppState;

const LAST_EVENT_ID_HEADER: &str = "last-event-id";

pub type FeedStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send + 'static>>;

pub async fn feed_page(
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
) -> AppResult<Json<FeedPage>> {
    let page = state
        .feed
        .changes_since(query.since.unwrap_or(0), query.limit)
        .await?;
    Ok(Json(page))
}

/// SSE stream of job events. With a cursor (`Last-Event-ID` or `since`) the
/// stream first replays every job changed after it, then switches to live.
///
/// Live push only carries mutations handled by this instance. Changes made
/// through other instances sharing the store arrive with the periodic resync
/// (`feed.sse_resync_secs`); `GET /feed` is always authoritative.
pub async fn feed_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<FeedQuery>,
) -> Sse<KeepAliveStream<FeedStream>> {
    let cursor = last_event_id(&headers).or(query.since);
    let keep_alive = Duration::from_secs(state.feed.config().sse_keep_alive_secs.max(1));

    Sse::new(build_feed_stream(state.feed.clone(), cursor)).keep_alive(
        KeepAlive::new()
            .interval(keep_alive)
            .text("keepalive"),
    )
}

fn last_event_id(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

enum Wake {
    Live(Option<Result<JobEvent, BroadcastStreamRecvError>>),
    Resync,
}

pub fn build_feed_stream(feed: ProgressFeed, cursor: Option<i64>) -> FeedStream {
    // Subscribe before replaying so nothing committed in between is lost.
    let receiver = feed.subscribe();
    let period = Duration::from_secs(feed.config().sse_resync_secs.max(1));

    let stream = async_stream::stream! {
        // Revisions above `floor` already pushed live.
        let mut sent_live = BTreeSet::new();

        let mut floor = match cursor {
            Some(since) => {
                let (jobs, reached) = catch_up(&feed, since).await;
                for job in jobs {
                    if let Some(event) = snapshot_event(&job) {
                        yield Ok::<Event, Infallible>(event);
                    }
                }
                reached
            }
            None => match feed.latest_revision().await {
                Ok(head) => head,
                Err(err) => {
                    warn!(error = %err, "failed to read feed head; starting from zero");
                    0
                }
            },
        };

        let mut live = BroadcastStream::new(receiver);
        let mut resync = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                item = live.next() => Wake::Live(item),
                _ = resync.tick() => Wake::Resync,
            };

            let lagged = match wake {
                Wake::Live(None) => break,
                Wake::Live(Some(Ok(event))) => {
                    let revision = event.revision();
                    // Already delivered by a replay.
                    if revision > floor && sent_live.insert(revision) {
                        if let Some(sse) = live_event(&event) {
                            yield Ok::<Event, Infallible>(sse);
                        }
                    }
                    continue;
                }
                Wake::Live(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(skipped, "feed subscriber lagged; replaying from store");
                    true
                }
                Wake::Resync => false,
            };

            let (jobs, reached) = catch_up(&feed, floor).await;
            if lagged || !jobs.is_empty() {
                debug!(floor, reached, jobs = jobs.len(), "feed resync");
            }
            floor = reached.max(floor);
            for job in jobs {
                if sent_live.contains(&job.job.revision) {
                    continue;
                }
                if let Some(event) = snapshot_event(&job) {
                    yield Ok::<Event, Infallible>(event);
                }
            }
            sent_live = sent_live.split_off(&(floor + 1));
        }
    };

    Box::pin(stream)
}

/// Every job changed after `since`, across as many pages as needed.
async fn catch_up(feed: &ProgressFeed, since: i64) -> (Vec<JobView>, i64) {
    let mut cursor = since;
    let mut jobs = Vec::new();
    loop {
        match feed.changes_since(cursor, None).await {
            Ok(page) if page.jobs.is_empty() => break,
            Ok(page) => {
                cursor = page.next_cursor;
                jobs.extend(page.jobs);
            }
            Err(err) => {
                warn!(error = %err, cursor, "feed replay failed");
                break;
            }
        }
    }
    (jobs, cursor)
}

fn snapshot_event(job: &JobView) -> Option<Event> {
    Event::default()
        .event("job_snapshot")
        .id(job.job.revision.to_string())
        .json_data(job)
        .map_err(|err| warn!(job_id = %job.job.id, error = %err, "failed to encode snapshot"))
        .ok()
}

fn live_event(event: &JobEvent) -> Option<Event> {
    Event::default()
        .event("job_event")
        .id(event.revision().to_string())
        .json_data(event)
        .map_err(|err| warn!(job_id = %event.job.job.id, error = %err, "failed to encode job event"))
        .ok()
}
