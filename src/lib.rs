// Core modules
mod config;
pub mod db;
mod executor;
pub mod scheduler;
pub mod api;

// Re-export key types and functions
pub use config::SchedulerConfig;
pub use db::{
    create_connection, ensure_schema, DatabaseConfig, Db, ExecutionCreate, ExecutionFilter,
    ExecutionRecord, ExecutionStatus, ExecutionStore, ScheduleCreate, ScheduleRecord,
    ScheduleStore, ScheduleUpdate,
};
pub use executor::{
    ExecutionRequest, ExecutorError, HttpPluginExecutor, PluginExecutor, DEFAULT_RETRY_AFTER,
    MAX_RETRY_AFTER,
};
pub use scheduler::{
    EnqueueSummary, Enqueuer, MetricsRecorder, RunSummary, Runner, Scheduler, SchedulerHandle,
    StaleReaper, TickOrchestrator, TickSummary,
};

use anyhow::Result;
use std::sync::Arc;

/// Convenience function to open the store, apply the schema and build a
/// [`Scheduler`] on top of it.
pub async fn create_scheduler(
    db_config: DatabaseConfig,
    executor: Arc<dyn PluginExecutor>,
    config: SchedulerConfig,
) -> Result<Arc<Scheduler>> {
    let db = create_connection(db_config).await?;
    ensure_schema(&db).await?;

    Ok(Arc::new(Scheduler::new(db, executor, config)?))
}
