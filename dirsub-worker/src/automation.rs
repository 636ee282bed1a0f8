use std::time::Duration;

use async_trait::async_trait;
use dirsub_core::worker::{AttemptOutcome, AutomationCapability};
use dirsub_core::{BusinessProfile, DirsubError, Result, Submission};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::debug;

#[derive(Serialize)]
struct AttemptRequest<'a> {
    target: &'a Submission,
    payload: &'a BusinessProfile,
}

/// Delegates form filling to an external automation service.
///
/// The service answers `POST {endpoint}` with an [`AttemptOutcome`] body.
/// Timeouts, connection errors, 408, 429 and 5xx are treated as transient;
/// any other non-success status is a permanent rejection.
#[derive(Debug, Clone)]
pub struct HttpAutomation {
    client: Client,
    endpoint: String,
}

impl HttpAutomation {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| DirsubError::Internal(format!("failed to create HTTP client: {err}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

#[async_trait]
impl AutomationCapability for HttpAutomation {
    async fn attempt(&self, target: &Submission, payload: &BusinessProfile) -> AttemptOutcome {
        let response = match self
            .client
            .post(&self.endpoint)
            .json(&AttemptRequest { target, payload })
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return AttemptOutcome::TransientFailure {
                    reason: "timeout".into(),
                };
            }
            Err(err) => {
                return AttemptOutcome::TransientFailure {
                    reason: format!("automation unreachable: {err}"),
                };
            }
        };

        let status = response.status();
        if status.is_success() {
            return match response.json::<AttemptOutcome>().await {
                Ok(outcome) => outcome,
                Err(err) => AttemptOutcome::TransientFailure {
                    reason: format!("invalid automation response: {err}"),
                },
            };
        }

        let body = response.text().await.unwrap_or_default();
        debug!(
            target_name = %target.target_name,
            status = status.as_u16(),
            "automation rejected attempt"
        );
        let reason = if body.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {body}")
        };

        if is_transient_status(status) {
            AttemptOutcome::TransientFailure { reason }
        } else {
            AttemptOutcome::PermanentFailure { reason }
        }
    }
}
