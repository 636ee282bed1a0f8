//! # Dirsub Core
//!
//! Core library for the directory submission orchestrator: distributes
//! per-customer batches of directory submissions across a pool of automation
//! workers, tracks progress per target and per job, and guarantees that no two
//! workers ever hold the same job at the same time.
//!
//! ## Overview
//!
//! - **Job Store**: [`store::JobStore`] with an in-memory and a Postgres backend;
//!   the only place lease ownership is decided
//! - **Leases**: time-bounded exclusive claims with heartbeat renewal and
//!   expiry-based reclamation
//! - **Orchestrator**: the stateless [`orchestrator::OrchestratorApi`] used by workers
//!   plus staff operations (pause, resume, retry)
//! - **Progress feed**: revision-cursored polling and an in-process push bus
//! - **Worker agent**: poll loop driving submissions through an
//!   [`worker::AutomationCapability`]
//!
//! ## Feature Flags
//!
//! - `database`: Enables the Postgres job store and embedded migrations (SQLx)
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use dirsub_core::{
//!     InMemoryJobStore, InProcJobEventBus, NewJob, NewTarget, OrchestratorApi,
//!     OrchestratorConfig, OrchestratorService, WorkerId,
//! };
//!
//! async fn provision_and_assign() -> dirsub_core::Result<()> {
//!     let config = OrchestratorConfig::default();
//!     let store = Arc::new(InMemoryJobStore::new(&config));
//!     let bus = Arc::new(InProcJobEventBus::new(config.feed.channel_capacity));
//!     let service = OrchestratorService::new(store, bus);
//!
//!     service
//!         .create_job(NewJob {
//!             customer_id: "cust-42".into(),
//!             priority_level: 1,
//!             payload: Default::default(),
//!             targets: vec![NewTarget::named("yelp"), NewTarget::named("bing-places")],
//!         })
//!         .await?;
//!
//!     let assignment = service.request_job(&WorkerId::from("worker-1")).await?;
//!     println!("{assignment:?}");
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Wire request bodies and error envelopes
pub mod api;
pub mod clock;
/// Configuration loading and defaults
pub mod config;
/// Error types and the crate-wide `Result` alias
pub mod error;
pub mod event_bus;
pub mod events;
/// Dashboard read side
pub mod feed;
/// Jobs, submissions and their identifiers
pub mod job;
pub mod lease;
pub mod orchestrator;
pub mod progress;
/// Job store trait and backends
pub mod store;
/// Pure state machine shared by every store backend
pub mod transitions;
/// Worker agent, automation seam and retry policy
pub mod worker;

#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FeedConfig, LeaseConfig, OrchestratorConfig, RetryConfig, WorkerConfig};
pub use error::{DirsubError, Result};
pub use event_bus::{InProcJobEventBus, JobEventStream};
pub use events::{JobEvent, JobEventPayload, JobEventPublisher};
pub use feed::{FeedPage, JobDetail, ProgressFeed};
pub use job::{
    BusinessProfile, FailureReason, Job, JobId, JobStatus, JobView, NewJob, NewTarget, Submission,
    SubmissionErrorKind, SubmissionId, SubmissionStatus, WorkerId,
};
pub use lease::{AcquireOutcome, JobAssignment, Lease, LeaseGrant, SweepReport};
pub use orchestrator::{OrchestratorApi, OrchestratorService};
pub use progress::{CompletionSummary, ProgressOutcome, ProgressReport, SubmissionUpdate};
pub use store::{InMemoryJobStore, JobStore};
#[cfg(feature = "database")]
pub use store::PostgresJobStore;
