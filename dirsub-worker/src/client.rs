use std::time::Duration;

use async_trait::async_trait;
use dirsub_core::api::{
    API_PREFIX, CompleteRequest, HeartbeatRequest, ProgressRequest, WireError, WorkerRequest,
};
use dirsub_core::{
    CompletionSummary, DirsubError, Job, JobAssignment, JobId, Lease, OrchestratorApi,
    ProgressReport, Result, WorkerId,
};
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

/// [`OrchestratorApi`] over the server's HTTP worker protocol.
///
/// Network failures and 5xx responses surface as [`DirsubError::Transport`]
/// so the agent can re-send; 4xx error bodies are mapped back onto the
/// domain error they were produced from.
#[derive(Debug, Clone)]
pub struct HttpOrchestratorClient {
    client: Client,
    base_url: String,
}

fn transport(err: reqwest::Error) -> DirsubError {
    DirsubError::Transport(err.to_string())
}

impl HttpOrchestratorClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| DirsubError::Internal(format!("failed to create HTTP client: {err}")))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!(base_url = %base_url, "orchestrator client created");
        Ok(Self { client, base_url })
    }

    /// Build a versioned API URL
    pub fn build_url(&self, path: &str) -> String {
        format!("{}{}/{}", self.base_url, API_PREFIX, path.trim_start_matches('/'))
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.build_url(path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|err| {
                DirsubError::Transport(format!("invalid response body from {url}: {err}"))
            });
        }

        let text = response.text().await.map_err(transport)?;
        debug!(%url, status = status.as_u16(), "orchestrator returned an error");
        match serde_json::from_str::<WireError>(&text) {
            Ok(wire) if status.is_server_error() => Err(DirsubError::Transport(format!(
                "{} ({}): {}",
                wire.error.code, status, wire.error.message
            ))),
            Ok(wire) => Err(DirsubError::from_wire(&wire.error)),
            Err(_) if status.is_server_error() => {
                Err(DirsubError::Transport(format!("{status}: {text}")))
            }
            Err(_) => Err(DirsubError::Internal(format!(
                "request to {url} failed with status {status}: {text}"
            ))),
        }
    }
}

#[async_trait]
impl OrchestratorApi for HttpOrchestratorClient {
    async fn request_job(&self, worker: &WorkerId) -> Result<JobAssignment> {
        self.post(
            "worker/jobs/request",
            &WorkerRequest {
                worker_id: worker.clone(),
            },
        )
        .await
    }

    async fn report_progress(&self, worker: &WorkerId, report: ProgressReport) -> Result<Job> {
        let path = format!("worker/jobs/{}/progress", report.job_id);
        self.post(
            &path,
            &ProgressRequest {
                worker_id: worker.clone(),
                submission_id: report.submission_id,
                sequence: report.sequence,
                outcome: report.outcome,
                attempts: report.attempts,
            },
        )
        .await
    }

    async fn complete_job(
        &self,
        worker: &WorkerId,
        job_id: JobId,
        summary: CompletionSummary,
    ) -> Result<Job> {
        self.post(
            &format!("worker/jobs/{job_id}/complete"),
            &CompleteRequest {
                worker_id: worker.clone(),
                summary,
            },
        )
        .await
    }

    async fn heartbeat(
        &self,
        worker: &WorkerId,
        job_id: JobId,
        current_target: Option<String>,
    ) -> Result<Lease> {
        self.post(
            &format!("worker/jobs/{job_id}/heartbeat"),
            &HeartbeatRequest {
                worker_id: worker.clone(),
                current_target,
            },
        )
        .await
    }

    async fn release(&self, worker: &WorkerId, job_id: JobId) -> Result<Job> {
        self.post(
            &format!("worker/jobs/{job_id}/release"),
            &WorkerRequest {
                worker_id: worker.clone(),
            },
        )
        .await
    }
}
