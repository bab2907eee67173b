use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Runtime settings for the tick loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// When false the tick loop is not started; run-now still works.
    pub enabled: bool,
    pub interval_seconds: u64,
    /// Upper bound on schedules enqueued and executions run per tick.
    pub batch_limit: u32,
    /// RUNNING executions older than this are failed by the reaper.
    pub stale_timeout_seconds: u64,
    /// Max executor calls in flight at once within one tick.
    pub concurrency: usize,
    /// How long an enqueue claim on a schedule stays exclusive.
    pub claim_lease_seconds: u64,
    /// Number of tick summaries retained for the metrics endpoint.
    pub metrics_capacity: usize,
    pub agent_key: Option<String>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: env_flag("PLUGIN_SCHEDULER_ENABLED", true),
            interval_seconds: env_or("PLUGIN_SCHEDULER_INTERVAL_SECONDS", 30),
            batch_limit: env_or("PLUGIN_SCHEDULER_BATCH_LIMIT", 10),
            stale_timeout_seconds: env_or("PLUGIN_SCHEDULER_STALE_TIMEOUT_SECONDS", 900),
            concurrency: env_or("PLUGIN_SCHEDULER_CONCURRENCY", 4),
            claim_lease_seconds: env_or("PLUGIN_SCHEDULER_CLAIM_LEASE_SECONDS", 60),
            metrics_capacity: env_or("PLUGIN_SCHEDULER_METRICS_CAPACITY", 100),
            agent_key: env::var("PLUGIN_SCHEDULER_AGENT_KEY").ok(),
        }
    }
}

/// Upper bound for every duration setting (one year).
pub const MAX_DURATION_SECONDS: u64 = 365 * 24 * 3600;

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.interval_seconds > 0, "interval_seconds must be positive");
        ensure!(self.batch_limit > 0, "batch_limit must be positive");
        ensure!(self.stale_timeout_seconds > 0, "stale_timeout_seconds must be positive");
        ensure!(self.concurrency > 0, "concurrency must be positive");
        ensure!(self.claim_lease_seconds > 0, "claim_lease_seconds must be positive");
        for (name, value) in [
            ("interval_seconds", self.interval_seconds),
            ("stale_timeout_seconds", self.stale_timeout_seconds),
            ("claim_lease_seconds", self.claim_lease_seconds),
        ] {
            ensure!(
                value <= MAX_DURATION_SECONDS,
                "{} must be at most {}",
                name,
                MAX_DURATION_SECONDS
            );
        }
        ensure!(self.metrics_capacity > 0, "metrics_capacity must be positive");
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Concurrency never exceeds the batch size.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.min(self.batch_limit as usize).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            enabled: true,
            interval_seconds: 30,
            batch_limit: 10,
            stale_timeout_seconds: 900,
            concurrency: 4,
            claim_lease_seconds: 60,
            metrics_capacity: 100,
            agent_key: None,
        }
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(config().validate().is_ok());

        let mut cfg = config();
        cfg.batch_limit = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.stale_timeout_seconds = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_durations() {
        let mut cfg = config();
        cfg.stale_timeout_seconds = u64::MAX / 1000;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.claim_lease_seconds = MAX_DURATION_SECONDS + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.interval_seconds = MAX_DURATION_SECONDS;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_concurrency_is_clamped_to_batch() {
        let mut cfg = config();
        cfg.batch_limit = 2;
        cfg.concurrency = 16;
        assert_eq!(cfg.effective_concurrency(), 2);
    }
}
