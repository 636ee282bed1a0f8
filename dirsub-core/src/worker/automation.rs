use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::job::{BusinessProfile, Submission};

/// Result of one automation attempt against a directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Form submitted. `confirmed` means the directory approved it synchronously.
    Success { confirmed: bool },
    /// Worth retrying (timeouts, rate limits, flaky pages).
    TransientFailure { reason: String },
    /// Retrying cannot help (listing rejected, form gone).
    PermanentFailure { reason: String },
}

/// Black-box capability that fills one directory form for a business.
#[async_trait]
pub trait AutomationCapability: Send + Sync + fmt::Debug {
    async fn attempt(&self, target: &Submission, payload: &BusinessProfile) -> AttemptOutcome;
}
