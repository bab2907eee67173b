//! Timer loop driving [`Scheduler::tick`].

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::Scheduler;

pub struct TickOrchestrator {
    scheduler: Arc<Scheduler>,
}

/// Stops the loop started by [`TickOrchestrator::spawn`].
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the loop and wait for the tick in progress, if any, to finish.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.join.await.context("scheduler loop panicked")
    }
}

impl TickOrchestrator {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    /// Start ticking on the configured interval. The first tick fires
    /// immediately. Ticks never overlap within the loop; a tick that runs
    /// past its slot causes the missed slots to be dropped.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let scheduler = self.scheduler;
        let period = scheduler.config().interval();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_seconds = period.as_secs(), "scheduler loop started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        match scheduler.tick().await {
                            Ok(summary) => debug!(
                                reaped = summary.reaped,
                                enqueued = summary.enqueue.enqueued,
                                skipped = summary.enqueue.skipped,
                                attempted = summary.run.attempted,
                                "tick complete"
                            ),
                            Err(e) => error!(error = %e, "scheduler tick failed"),
                        }
                    }
                }
            }

            info!("scheduler loop stopped");
        });

        SchedulerHandle { shutdown, join }
    }
}
