// Periodic plugin execution: enqueue due schedules, run pending executions,
// reap stale ones, remember recent tick outcomes.

pub mod enqueue;
pub mod metrics;
pub mod reaper;
pub mod runner;
pub mod tick;


pub use enqueue::{EnqueueSummary, Enqueuer};
pub use metrics::{MetricsRecorder, TickSummary};
pub use reaper::StaleReaper;
pub use runner::{RunSummary, Runner};
pub use tick::{SchedulerHandle, TickOrchestrator};

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::db::Db;
use crate::executor::PluginExecutor;

/// One process's view of the scheduler. Any number of these may share a
/// store; correctness across them rests on the claim discipline of the
/// enqueuer and runner.
pub struct Scheduler {
    db: Db,
    config: SchedulerConfig,
    enqueuer: Enqueuer,
    runner: Runner,
    reaper: StaleReaper,
    metrics: MetricsRecorder,
}

impl Scheduler {
    pub fn new(db: Db, executor: Arc<dyn PluginExecutor>, config: SchedulerConfig) -> Result<Self> {
        config.validate()?;

        let enqueuer = Enqueuer::new(db.clone(), Duration::from_secs(config.claim_lease_seconds));
        let runner = Runner::new(
            db.clone(),
            executor,
            config.effective_concurrency(),
            config.agent_key.clone(),
        );
        let reaper = StaleReaper::new(db.clone());
        let metrics = MetricsRecorder::new(config.metrics_capacity);

        Ok(Self {
            db,
            config,
            enqueuer,
            runner,
            reaper,
            metrics,
        })
    }

    /// Reap, enqueue, run, then record the outcome in the metrics ring.
    pub async fn tick(&self) -> Result<TickSummary> {
        let reaped = self
            .reaper
            .cleanup_stale_executions(self.config.stale_timeout_seconds)
            .await?;
        let enqueue = self
            .enqueuer
            .enqueue_due_schedules(self.config.batch_limit, None)
            .await?;
        let run = self.runner.run_pending(self.config.batch_limit, None).await?;

        let summary = TickSummary {
            recorded_at: Utc::now(),
            reaped,
            enqueue,
            run,
        };
        self.metrics.record(summary.clone()).await;
        Ok(summary)
    }

    /// Enqueue and run once on demand. Ownerless schedules fall back to
    /// `fallback_user_id`. Not recorded in the metrics ring.
    pub async fn run_now(&self, fallback_user_id: Option<&str>) -> Result<TickSummary> {
        let enqueue = self
            .enqueuer
            .enqueue_due_schedules(self.config.batch_limit, fallback_user_id)
            .await?;
        let run = self.runner.run_pending(self.config.batch_limit, None).await?;

        Ok(TickSummary {
            recorded_at: Utc::now(),
            reaped: 0,
            enqueue,
            run,
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    pub fn enqueuer(&self) -> &Enqueuer {
        &self.enqueuer
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    pub fn reaper(&self) -> &StaleReaper {
        &self.reaper
    }
}
