//! Claims PENDING executions and drives them through the plugin executor.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use surrealdb::RecordId;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::db::{Db, ExecutionRecord, ExecutionStore};
use crate::executor::{ExecutionRequest, ExecutorError, MAX_RETRY_AFTER, PluginExecutor};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub deferred: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
    Deferred,
}

pub struct Runner {
    db: Db,
    executor: Arc<dyn PluginExecutor>,
    concurrency: usize,
    agent_key: Option<String>,
}

impl Runner {
    pub fn new(
        db: Db,
        executor: Arc<dyn PluginExecutor>,
        concurrency: usize,
        agent_key: Option<String>,
    ) -> Self {
        Self {
            db,
            executor,
            concurrency: concurrency.max(1),
            agent_key,
        }
    }

    /// Run up to `limit` eligible PENDING executions (optionally only those
    /// of one schedule), each of them once.
    ///
    /// A row is claimed only once a concurrency slot is free, so `started_at`
    /// marks when its executor call actually begins. Rows another process
    /// claims first are skipped and not counted. Executions are resolved
    /// independently; a failure while handling one never stops the rest.
    pub async fn run_pending(
        &self,
        limit: u32,
        schedule_id: Option<&RecordId>,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        if limit == 0 {
            return Ok(summary);
        }

        let candidates =
            ExecutionStore::find_claimable(&self.db, Utc::now(), limit, schedule_id).await?;
        if candidates.is_empty() {
            return Ok(summary);
        }

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for candidate in candidates {
            let db = self.db.clone();
            let executor = self.executor.clone();
            let agent_key = self.agent_key.clone();
            let permits = permits.clone();

            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let execution = claim(&db, &candidate).await?;
                Some(process(&db, executor.as_ref(), execution, agent_key).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(None) => continue,
                Ok(Some(Outcome::Succeeded)) => summary.succeeded += 1,
                Ok(Some(Outcome::Failed)) => summary.failed += 1,
                Ok(Some(Outcome::Deferred)) => summary.deferred += 1,
                Err(e) => {
                    // Panicked task; its row stays RUNNING until the reaper fails it.
                    error!(error = %e, "execution task aborted");
                    summary.failed += 1;
                }
            }
            summary.attempted += 1;
        }

        if summary.attempted > 0 {
            info!(
                attempted = summary.attempted,
                succeeded = summary.succeeded,
                failed = summary.failed,
                deferred = summary.deferred,
                "ran pending executions"
            );
        }
        Ok(summary)
    }
}

async fn claim(db: &Db, candidate: &ExecutionRecord) -> Option<ExecutionRecord> {
    match ExecutionStore::try_claim(db, candidate, Utc::now()).await {
        Ok(Some(execution)) => Some(execution),
        Ok(None) => {
            debug!(execution_id = %candidate.id, "execution claimed elsewhere");
            None
        }
        Err(e) => {
            warn!(execution_id = %candidate.id, error = %e, "failed to claim execution");
            None
        }
    }
}

async fn process(
    db: &Db,
    executor: &dyn PluginExecutor,
    execution: ExecutionRecord,
    agent_key: Option<String>,
) -> Outcome {
    let request = ExecutionRequest {
        plugin_name: execution.plugin_name.clone(),
        params: execution.params.clone(),
        user_id: execution.user_id.clone(),
        agent_key,
    };

    let outcome = executor.execute(request).await;
    let now = Utc::now();

    let resolved = match outcome {
        Ok(result) => ExecutionStore::mark_completed(db, &execution, result, now)
            .await
            .map(|ok| (ok, Outcome::Succeeded)),
        Err(ExecutorError::RateLimited {
            status,
            retry_after,
            reason,
        }) => {
            let retry_after = retry_after.min(MAX_RETRY_AFTER);
            let eligible_at = chrono::Duration::from_std(retry_after)
                .ok()
                .and_then(|backoff| now.checked_add_signed(backoff))
                .unwrap_or(now);
            info!(
                execution_id = %execution.id,
                plugin = %execution.plugin_name,
                status,
                retry_after_secs = retry_after.as_secs(),
                "execution deferred by rate limit"
            );
            let reason = format!("{} (status {}, retry after {}s)", reason, status, retry_after.as_secs());
            ExecutionStore::mark_deferred(db, &execution, &reason, eligible_at, now)
                .await
                .map(|ok| (ok, Outcome::Deferred))
        }
        Err(ExecutorError::Failed(message)) => {
            let message = if message.trim().is_empty() {
                "executor failed without a message".to_string()
            } else {
                message
            };
            warn!(
                execution_id = %execution.id,
                plugin = %execution.plugin_name,
                error = %message,
                "execution failed"
            );
            ExecutionStore::mark_failed(db, &execution, &message, now)
                .await
                .map(|ok| (ok, Outcome::Failed))
        }
    };

    match resolved {
        Ok((true, outcome)) => outcome,
        Ok((false, _)) => {
            // The row left RUNNING under us, which only the reaper does.
            warn!(execution_id = %execution.id, "execution was reaped before it resolved");
            Outcome::Failed
        }
        Err(e) => {
            error!(execution_id = %execution.id, error = %e, "failed to record execution outcome");
            Outcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        create_connection, ensure_schema, to_utc, DatabaseConfig, ExecutionCreate,
        ExecutionStatus,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn setup_test_db() -> Db {
        let config = DatabaseConfig {
            url: "memory".to_string(),
            ..Default::default()
        };
        let db = create_connection(config).await.unwrap();
        ensure_schema(&db).await.unwrap();
        db
    }

    /// Picks its behaviour from the plugin name.
    struct ScriptedExecutor {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PluginExecutor for ScriptedExecutor {
        async fn execute(&self, request: ExecutionRequest) -> Result<Value, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match request.plugin_name.as_str() {
                "ok" => Ok(json!({ "user": request.user_id, "params": request.params })),
                "limited" => Err(ExecutorError::rate_limited(Duration::from_secs(120), "quota")),
                "silent" => Err(ExecutorError::failed("")),
                "flood" => Err(ExecutorError::rate_limited(
                    Duration::from_secs(9_000_000_000_000),
                    "quota",
                )),
                _ => Err(ExecutorError::failed("plugin exploded")),
            }
        }
    }

    async fn adhoc(db: &Db, plugin: &str) -> ExecutionRecord {
        ExecutionStore::create_adhoc(
            db,
            &ExecutionCreate {
                plugin_name: plugin.to_string(),
                user_id: "alice".to_string(),
                params: json!({ "n": 1 }),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_success_completes_execution() {
        let db = setup_test_db().await;
        let executor = ScriptedExecutor::new();
        let runner = Runner::new(db.clone(), executor.clone(), 4, None);
        let execution = adhoc(&db, "ok").await;

        let summary = runner.run_pending(10, None).await.unwrap();
        assert_eq!(
            summary,
            RunSummary { attempted: 1, succeeded: 1, failed: 0, deferred: 0 }
        );

        let stored = ExecutionStore::get(&db, &execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert_eq!(stored.result.unwrap()["user"], "alice");
        assert!(stored.completed_at.is_some());
        assert!(stored.started_at.is_some());
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_defers_execution() {
        let db = setup_test_db().await;
        let runner = Runner::new(db.clone(), ScriptedExecutor::new(), 4, None);
        let execution = adhoc(&db, "limited").await;

        let before = Utc::now();
        let summary = runner.run_pending(10, None).await.unwrap();
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.attempted, 1);

        let stored = ExecutionStore::get(&db, &execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Pending);
        assert!(stored.error.as_deref().unwrap().starts_with("deferred:"));
        assert!(stored.completed_at.is_none());
        let eligible = to_utc(stored.started_at.as_ref().unwrap());
        assert!(eligible >= before + chrono::Duration::seconds(120));

        // Not eligible again until the backoff passes.
        let summary = runner.run_pending(10, None).await.unwrap();
        assert_eq!(summary, RunSummary::default());
    }

    #[tokio::test]
    async fn test_other_errors_fail_execution() {
        let db = setup_test_db().await;
        let runner = Runner::new(db.clone(), ScriptedExecutor::new(), 4, None);
        let boom = adhoc(&db, "boom").await;
        let silent = adhoc(&db, "silent").await;

        let summary = runner.run_pending(10, None).await.unwrap();
        assert_eq!(summary.failed, 2);

        for id in [&boom.id, &silent.id] {
            let stored = ExecutionStore::get(&db, id).await.unwrap().unwrap();
            assert_eq!(stored.status, ExecutionStatus::Failed);
            assert!(!stored.error.unwrap().is_empty());
            assert!(stored.completed_at.is_some());
        }

        // No automatic retry.
        assert_eq!(runner.run_pending(10, None).await.unwrap(), RunSummary::default());
    }

    #[tokio::test]
    async fn test_mixed_batch_is_processed_independently() {
        let db = setup_test_db().await;
        let runner = Runner::new(db.clone(), ScriptedExecutor::new(), 2, None);
        for plugin in ["ok", "boom", "limited", "ok"] {
            adhoc(&db, plugin).await;
        }

        let summary = runner.run_pending(10, None).await.unwrap();
        assert_eq!(
            summary,
            RunSummary { attempted: 4, succeeded: 2, failed: 1, deferred: 1 }
        );
    }

    #[tokio::test]
    async fn test_run_respects_limit_and_concurrency() {
        let db = setup_test_db().await;
        let executor = ScriptedExecutor::new();
        let runner = Runner::new(db.clone(), executor.clone(), 2, None);
        for _ in 0..7 {
            adhoc(&db, "ok").await;
        }

        let summary = runner.run_pending(5, None).await.unwrap();
        assert_eq!(summary.attempted, 5);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 5);
        assert!(executor.max_in_flight.load(Ordering::SeqCst) <= 2);

        let summary = runner.run_pending(5, None).await.unwrap();
        assert_eq!(summary.attempted, 2);
    }

    #[tokio::test]
    async fn test_oversized_backoff_still_defers() {
        let db = setup_test_db().await;
        let runner = Runner::new(db.clone(), ScriptedExecutor::new(), 4, None);
        let execution = adhoc(&db, "flood").await;

        let before = Utc::now();
        let summary = runner.run_pending(10, None).await.unwrap();
        assert_eq!(
            summary,
            RunSummary { attempted: 1, succeeded: 0, failed: 0, deferred: 1 }
        );

        let stored = ExecutionStore::get(&db, &execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Pending);
        assert!(stored.error.as_deref().unwrap().starts_with("deferred:"));
        let eligible = to_utc(stored.started_at.as_ref().unwrap());
        let cap = chrono::Duration::from_std(MAX_RETRY_AFTER).unwrap();
        assert!(eligible >= before + cap);
        assert!(eligible <= Utc::now() + cap);
    }

    #[tokio::test]
    async fn test_rows_are_claimed_when_a_slot_frees() {
        let db = setup_test_db().await;
        let runner = Runner::new(db.clone(), ScriptedExecutor::new(), 1, None);
        let first = adhoc(&db, "ok").await;
        let second = adhoc(&db, "ok").await;

        let summary = runner.run_pending(10, None).await.unwrap();
        assert_eq!(summary.succeeded, 2);

        let a = ExecutionStore::get(&db, &first.id).await.unwrap().unwrap();
        let b = ExecutionStore::get(&db, &second.id).await.unwrap().unwrap();
        let (earlier, later) = if to_utc(a.started_at.as_ref().unwrap())
            <= to_utc(b.started_at.as_ref().unwrap())
        {
            (a, b)
        } else {
            (b, a)
        };
        // With one slot, the second row is not claimed until the first resolves.
        assert!(
            to_utc(later.started_at.as_ref().unwrap())
                >= to_utc(earlier.completed_at.as_ref().unwrap())
        );
    }

    #[tokio::test]
    async fn test_run_filters_by_schedule() {
        let db = setup_test_db().await;
        let runner = Runner::new(db.clone(), ScriptedExecutor::new(), 2, None);
        let schedule_id = RecordId::from_table_key("schedule", "feed");
        ExecutionStore::insert_pending(&db, Some(&schedule_id), "ok", &json!({}), "alice", Utc::now())
            .await
            .unwrap();
        adhoc(&db, "ok").await;

        let summary = runner.run_pending(10, Some(&schedule_id)).await.unwrap();
        assert_eq!(summary.attempted, 1);
        let summary = runner.run_pending(10, None).await.unwrap();
        assert_eq!(summary.attempted, 1);
    }
}
