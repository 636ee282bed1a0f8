//! Worker side: the automation seam, retry backoff and the agent loop.

pub mod agent;
pub mod automation;
pub mod backoff;

pub use agent::{JobRunOutcome, PollOutcome, WorkerAgent};
pub use automation::{AttemptOutcome, AutomationCapability};
pub use backoff::{IdleBackoff, retry_delay};
