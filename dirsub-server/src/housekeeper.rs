use std::time::Duration;

use dirsub_core::OrchestratorService;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodically reclaims lapsed leases so abandoned jobs do not wait for the
/// next `request_job` to notice them.
pub fn spawn_housekeeper(
    service: OrchestratorService,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "lease housekeeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            match service.sweep_expired_leases().await {
                Ok(report) if report.is_empty() => debug!("no lapsed leases"),
                Ok(report) => info!(
                    requeued = report.requeued.len(),
                    worker_unavailable = report.worker_unavailable.len(),
                    "reclaimed lapsed leases"
                ),
                Err(err) => warn!(error = %err, "lease sweep failed"),
            }
        }

        info!("lease housekeeper stopped");
    })
}
