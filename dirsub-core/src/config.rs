use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// Global knobs that tune orchestrator and worker behaviour.
///
/// All fields carry defaults so deployments can supply a partial
/// configuration payload and only override what they need.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Lease defaults (TTL, reclamation policy, housekeeping cadence).
    pub lease: LeaseConfig,
    /// Retry/backoff policy applied by workers to transient failures.
    pub retry: RetryConfig,
    /// Worker poll loop tuning.
    pub worker: WorkerConfig,
    /// Change feed sizing.
    pub feed: FeedConfig,
}

impl OrchestratorConfig {
    /// Load configuration overrides. Evaluation order:
    /// 1) `$DIRSUB_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$DIRSUB_CONFIG_JSON` (inline JSON),
    /// 3) the first existing default file candidate,
    /// 4) defaults.
    pub fn load_from_env() -> anyhow::Result<Self> {
        if let Ok(path) = env::var("DIRSUB_CONFIG_PATH") {
            return Self::load_from_file(Path::new(&path));
        }

        if let Ok(raw) = env::var("DIRSUB_CONFIG_JSON") {
            return Self::parse_json(&raw).context("failed to parse DIRSUB_CONFIG_JSON");
        }

        if let Some(path) = Self::find_default_file() {
            return Self::load_from_file(&path);
        }

        Ok(Self::default())
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read orchestrator config from {}", path.display())
        })?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid orchestrator config {}", path.display()))?,
            Some("toml") | Some("tml") => toml::from_str(&contents).map_err(|err| {
                anyhow!("invalid orchestrator config {}: {}", path.display(), err)
            })?,
            _ => Self::parse_from_str(&contents, &path.display().to_string())?,
        };

        config.validate()?;
        Ok(config)
    }

    fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        // Try TOML first, then JSON for convenience.
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse orchestrator config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    fn parse_json(raw: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| anyhow!("invalid orchestrator config json: {err}"))?;
        config.validate()?;
        Ok(config)
    }

    fn find_default_file() -> Option<PathBuf> {
        const CANDIDATES: &[&str] = &[
            "dirsub.toml",
            "dirsub.json",
            "config/dirsub.toml",
            "config/dirsub.json",
        ];

        CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(|path| path.to_path_buf())
    }

    /// Reject combinations that would break lease or retry invariants.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lease.lease_ttl_secs <= 0 {
            return Err(anyhow!("lease.lease_ttl_secs must be positive"));
        }
        if self.lease.lease_ttl_secs > MAX_LEASE_TTL_SECS {
            return Err(anyhow!(
                "lease.lease_ttl_secs ({}) exceeds the {MAX_LEASE_TTL_SECS}s limit",
                self.lease.lease_ttl_secs
            ));
        }
        if self.lease.max_consecutive_expiries == 0 {
            return Err(anyhow!("lease.max_consecutive_expiries must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be at least 1"));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            return Err(anyhow!(
                "retry.backoff_base_ms ({}) exceeds retry.backoff_max_ms ({})",
                self.retry.backoff_base_ms,
                self.retry.backoff_max_ms
            ));
        }
        if self.worker.idle_poll_min_ms > self.worker.idle_poll_max_ms {
            return Err(anyhow!("worker.idle_poll_min_ms exceeds worker.idle_poll_max_ms"));
        }
        if self.feed.channel_capacity == 0 {
            return Err(anyhow!("feed.channel_capacity must be positive"));
        }
        Ok(())
    }
}

/// Upper bound for `lease.lease_ttl_secs` (one day).
pub const MAX_LEASE_TTL_SECS: i64 = 86_400;

/// Lease/heartbeat tuning.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LeaseConfig {
    /// TTL for job leases (seconds).
    pub lease_ttl_secs: i64,
    /// Consecutive lease expiries after which a job is failed as worker-unavailable.
    pub max_consecutive_expiries: u32,
    /// Housekeeping cadence for sweeping expired leases (ms).
    pub housekeeper_interval_ms: u64,
}

impl LeaseConfig {
    /// Lease TTL, clamped to `1..=MAX_LEASE_TTL_SECS` for configs that skipped validation.
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs.clamp(1, MAX_LEASE_TTL_SECS))
    }

    pub fn housekeeper_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeper_interval_ms)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 300,
            max_consecutive_expiries: 2,
            housekeeper_interval_ms: 15_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total automation attempts per submission, first try included.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            jitter_ratio: 0.2,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Lower bound of the idle poll backoff (ms).
    pub idle_poll_min_ms: u64,
    /// Upper bound of the idle poll backoff (ms).
    pub idle_poll_max_ms: u64,
    /// Explicit heartbeat cadence. Defaults to a quarter of the lease TTL and
    /// is ignored when it is not strictly smaller than the TTL.
    pub heartbeat_interval_ms: Option<u64>,
    /// Delay between consecutive submissions of one job (ms).
    pub submission_pacing_ms: u64,
    /// Upper bound on a single automation attempt (ms).
    pub attempt_timeout_ms: u64,
    /// Re-sends of a progress report after transport failures.
    pub report_retry_attempts: u32,
}

impl WorkerConfig {
    pub fn idle_poll_min(&self) -> Duration {
        Duration::from_millis(self.idle_poll_min_ms)
    }

    pub fn idle_poll_max(&self) -> Duration {
        Duration::from_millis(self.idle_poll_max_ms)
    }

    pub fn submission_pacing(&self) -> Duration {
        Duration::from_millis(self.submission_pacing_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Heartbeat cadence for a lease of the given TTL. Always strictly below the TTL.
    pub fn heartbeat_interval(&self, ttl: Duration) -> Duration {
        let fallback = ttl / 4;
        match self.heartbeat_interval_ms.map(Duration::from_millis) {
            Some(interval) if !interval.is_zero() && interval < ttl => interval,
            _ => fallback,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_poll_min_ms: 1_000,
            idle_poll_max_ms: 30_000,
            heartbeat_interval_ms: None,
            submission_pacing_ms: 2_000,
            attempt_timeout_ms: 60_000,
            report_retry_attempts: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeedConfig {
    /// Broadcast buffer for push subscribers. Slow subscribers lag past this.
    pub channel_capacity: usize,
    /// Largest page served by `changes_since`.
    pub max_page_size: usize,
    pub sse_keep_alive_secs: u64,
    /// How often SSE subscribers re-read the store for changes made elsewhere.
    pub sse_resync_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            max_page_size: 500,
            sse_keep_alive_secs: 15,
            sse_resync_secs: 5,
        }
    }
}
