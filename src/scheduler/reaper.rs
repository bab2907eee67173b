//! Fails executions left RUNNING by a worker that crashed or hung.

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::warn;

use crate::db::{Db, ExecutionStore};

pub struct StaleReaper {
    db: Db,
}

impl StaleReaper {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Mark every RUNNING execution claimed more than `timeout_seconds` ago
    /// as FAILED. Returns how many were reaped; a repeat call finds nothing.
    pub async fn cleanup_stale_executions(&self, timeout_seconds: u64) -> Result<usize> {
        let now = Utc::now();
        let Some(cutoff) = i64::try_from(timeout_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|timeout| now.checked_sub_signed(timeout))
        else {
            // Nothing can have been running that long.
            return Ok(0);
        };
        let error = format!("stale_timeout: exceeded {}s", timeout_seconds);

        let reaped = ExecutionStore::fail_stale(&self.db, cutoff, &error, now).await?;
        for execution in &reaped {
            warn!(
                execution_id = %execution.id,
                plugin = %execution.plugin_name,
                timeout_seconds,
                "failed stale execution"
            );
        }
        Ok(reaped.len())
    }
}
