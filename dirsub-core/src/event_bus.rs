use async_trait::async_trait;
use std::fmt;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::events::{JobEvent, JobEventPublisher};

/// In-process fan-out of job events to push subscribers (the SSE stream).
/// Subscribers that fall more than `capacity` events behind observe a lag and
/// are expected to resync through `changes_since`.
pub struct InProcJobEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl fmt::Debug for InProcJobEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcJobEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcJobEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl JobEventPublisher for InProcJobEventBus {
    async fn publish(&self, event: JobEvent) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}

pub trait JobEventStream {
    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent>;
}

impl JobEventStream for InProcJobEventBus {
    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::JobEventPayload;
    use crate::job::{BusinessProfile, NewJob, NewTarget};

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = InProcJobEventBus::new(8);
        let mut rx = bus.subscribe_jobs();

        let (job, _) = NewJob {
            customer_id: "cust".into(),
            priority_level: 0,
            payload: BusinessProfile::default(),
            targets: vec![NewTarget::named("yelp")],
        }
        .materialize(chrono::Utc::now())
        .expect("valid");

        bus.publish(JobEvent::new(&job, JobEventPayload::Created))
            .await
            .expect("publish");

        let event = rx.recv().await.expect("event");
        assert_eq!(event.job.job.id, job.id);
        assert_eq!(event.payload, JobEventPayload::Created);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_succeeds() {
        let bus = InProcJobEventBus::new(1);
        let (job, _) = NewJob {
            customer_id: "cust".into(),
            priority_level: 0,
            payload: BusinessProfile::default(),
            targets: vec![NewTarget::named("yelp")],
        }
        .materialize(chrono::Utc::now())
        .expect("valid");
        assert!(bus.publish(JobEvent::new(&job, JobEventPayload::Paused)).await.is_ok());
    }
}
