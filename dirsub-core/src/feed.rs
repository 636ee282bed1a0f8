use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::FeedConfig;
use crate::error::Result;
use crate::event_bus::InProcJobEventBus;
use crate::events::JobEvent;
use crate::job::{JobId, JobView, Submission};
use crate::store::JobStore;

/// One page of the poll-based change feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedPage {
    pub jobs: Vec<JobView>,
    /// Pass back as `since` to continue. Equals the request cursor when the page is empty.
    pub next_cursor: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub job: JobView,
    pub submissions: Vec<Submission>,
}

/// Read side for dashboards: revision-cursored polling, job detail and the
/// push subscription.
#[derive(Clone)]
pub struct ProgressFeed {
    store: Arc<dyn JobStore>,
    bus: Arc<InProcJobEventBus>,
    config: FeedConfig,
}

impl fmt::Debug for ProgressFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressFeed")
            .field("bus", &self.bus)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProgressFeed {
    pub fn new(store: Arc<dyn JobStore>, bus: Arc<InProcJobEventBus>, config: FeedConfig) -> Self {
        Self { store, bus, config }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Jobs changed after `since`, oldest change first. `limit` is clamped to
    /// `1..=max_page_size`.
    pub async fn changes_since(&self, since: i64, limit: Option<usize>) -> Result<FeedPage> {
        let limit = limit
            .unwrap_or(self.config.max_page_size)
            .clamp(1, self.config.max_page_size.max(1));
        let jobs = self.store.changes_since(since, limit).await?;
        let next_cursor = jobs.last().map(|job| job.revision).unwrap_or(since);

        Ok(FeedPage {
            jobs: jobs.into_iter().map(JobView::from).collect(),
            next_cursor,
        })
    }

    /// Cursor a new subscriber starts from when it has none of its own.
    pub async fn latest_revision(&self) -> Result<i64> {
        self.store.latest_revision().await
    }

    pub async fn job_detail(&self, job_id: JobId) -> Result<JobDetail> {
        let job = self.store.get_job(job_id).await?;
        let submissions = self.store.list_submissions(job_id).await?;
        Ok(JobDetail {
            job: job.into(),
            submissions,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.bus.subscribe()
    }
}
