// Data-access helpers for schedules and executions.
//
// Both stores are stateless: every function takes the store handle it should
// use. Claims are conditional single-record UPDATEs keyed on a `version`
// counter, so two processes racing for the same row partition the work
// instead of double-processing it.

use crate::db::connection::Db;
use crate::db::schema::*;
use anyhow::{anyhow, ensure, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use surrealdb::{RecordId, sql::Datetime};
use uuid::Uuid;

const CONFLICT_RETRIES: u32 = 5;

/// Whether a statement error is the store reporting a write conflict with a
/// concurrent transaction. For claims this just means another process won.
pub fn is_conflict(err: &surrealdb::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("conflict") || msg.contains("can be retried")
}

/// Re-run a conditional write that lost a commit race. Only used for writes
/// guarded by a claim token or version, so a retry can never apply twice.
async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = surrealdb::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_conflict(&e) && attempt < CONFLICT_RETRIES => {
                attempt += 1;
                tracing::debug!(attempt, "write conflict, retrying");
                tokio::time::sleep(Duration::from_millis(5 * attempt as u64)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn new_key() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Longest allowed schedule interval.
pub const MAX_INTERVAL_SECONDS: i64 = crate::config::MAX_DURATION_SECONDS as i64;

fn check_interval(interval_seconds: i64) -> Result<()> {
    ensure!(
        (1..=MAX_INTERVAL_SECONDS).contains(&interval_seconds),
        "interval_seconds must be between 1 and {}",
        MAX_INTERVAL_SECONDS
    );
    Ok(())
}

pub struct ScheduleStore;

impl ScheduleStore {
    pub async fn create(db: &Db, data: &ScheduleCreate) -> Result<ScheduleRecord> {
        ensure!(!data.plugin_name.trim().is_empty(), "plugin_name must not be empty");
        check_interval(data.interval_seconds)?;

        let now = Datetime::from(Utc::now());
        let mut res = db
            .query(
                r#"
                CREATE type::thing("schedule", $key) CONTENT {
                    plugin_name: $plugin_name,
                    params: $params,
                    interval_seconds: $interval_seconds,
                    enabled: $enabled,
                    owner_user_id: $owner_user_id,
                    next_run_at: $next_run_at,
                    last_run_at: NONE,
                    claimed_until: NONE,
                    claim_token: NONE,
                    version: 0,
                    created_at: $now,
                    updated_at: $now
                }
                "#,
            )
            .bind(("key", new_key()))
            .bind(("plugin_name", data.plugin_name.clone()))
            .bind(("params", data.params.clone()))
            .bind(("interval_seconds", data.interval_seconds))
            .bind(("enabled", data.enabled))
            .bind(("owner_user_id", data.owner_user_id.clone()))
            .bind(("next_run_at", data.next_run_at.map(Datetime::from)))
            .bind(("now", now))
            .await?;

        let created: Option<ScheduleRecord> = res.take(0)?;
        created.ok_or_else(|| anyhow!("failed to create schedule record"))
    }

    pub async fn get(db: &Db, id: &RecordId) -> Result<Option<ScheduleRecord>> {
        let mut res = db
            .query("SELECT * FROM schedule WHERE id = $id LIMIT 1")
            .bind(("id", id.clone()))
            .await?;

        let schedule: Option<ScheduleRecord> = res.take(0)?;
        Ok(schedule)
    }

    pub async fn list(db: &Db) -> Result<Vec<ScheduleRecord>> {
        let mut res = db
            .query("SELECT * FROM schedule ORDER BY created_at ASC")
            .await?;

        let schedules: Vec<ScheduleRecord> = res.take(0)?;
        Ok(schedules)
    }

    /// Apply a partial update. Returns `None` when the schedule does not exist.
    pub async fn update(
        db: &Db,
        id: &RecordId,
        update: &ScheduleUpdate,
    ) -> Result<Option<ScheduleRecord>> {
        if let Some(name) = &update.plugin_name {
            ensure!(!name.trim().is_empty(), "plugin_name must not be empty");
        }
        if let Some(interval) = update.interval_seconds {
            check_interval(interval)?;
        }

        let mut sets = vec!["updated_at = $now", "version += 1"];
        if update.plugin_name.is_some() {
            sets.push("plugin_name = $plugin_name");
        }
        if update.params.is_some() {
            sets.push("params = $params");
        }
        if update.interval_seconds.is_some() {
            sets.push("interval_seconds = $interval_seconds");
        }
        if update.enabled.is_some() {
            sets.push("enabled = $enabled");
        }
        if update.owner_user_id.is_some() {
            sets.push("owner_user_id = $owner_user_id");
        }
        if update.next_run_at.is_some() {
            sets.push("next_run_at = $next_run_at");
        }

        let query = format!("UPDATE $id SET {} RETURN AFTER", sets.join(", "));
        let mut res = db
            .query(query)
            .bind(("id", id.clone()))
            .bind(("now", Datetime::from(Utc::now())))
            .bind(("plugin_name", update.plugin_name.clone()))
            .bind(("params", update.params.clone()))
            .bind(("interval_seconds", update.interval_seconds))
            .bind(("enabled", update.enabled))
            .bind(("owner_user_id", update.owner_user_id.clone().flatten()))
            .bind((
                "next_run_at",
                update.next_run_at.flatten().map(Datetime::from),
            ))
            .await?;

        let updated: Vec<ScheduleRecord> = res.take(0)?;
        Ok(updated.into_iter().next())
    }

    /// Delete a schedule. Executions that reference it are kept.
    pub async fn delete(db: &Db, id: &RecordId) -> Result<bool> {
        let mut res = db
            .query("DELETE $id RETURN BEFORE")
            .bind(("id", id.clone()))
            .await?;

        let deleted: Vec<ScheduleRecord> = res.take(0)?;
        Ok(!deleted.is_empty())
    }

    /// Due, enabled, unleased schedules, oldest-due first. Schedules that
    /// have never run (`next_run_at = NONE`) sort ahead of everything else.
    pub async fn find_due(db: &Db, now: DateTime<Utc>, limit: u32) -> Result<Vec<ScheduleRecord>> {
        let mut res = db
            .query(
                r#"
                SELECT * FROM schedule
                WHERE enabled = true
                  AND (next_run_at = NONE OR next_run_at <= $now)
                  AND (claimed_until = NONE OR claimed_until < $now)
                ORDER BY next_run_at ASC
                LIMIT $limit
                "#,
            )
            .bind(("now", Datetime::from(now)))
            .bind(("limit", limit as i64))
            .await?;

        let schedules: Vec<ScheduleRecord> = res.take(0)?;
        Ok(schedules)
    }

    /// Take the enqueue lease on a due schedule if nobody changed it since it
    /// was read. `Ok(None)` means another claimer got there first.
    pub async fn try_claim(
        db: &Db,
        schedule: &ScheduleRecord,
        token: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<ScheduleRecord>> {
        let attempt: surrealdb::Result<Vec<ScheduleRecord>> = async {
            let mut res = db
                .query(
                    r#"
                    UPDATE $id SET
                        claimed_until = $lease_until,
                        claim_token = $lease_token,
                        version += 1
                    WHERE version = $version
                      AND enabled = true
                      AND (next_run_at = NONE OR next_run_at <= $now)
                      AND (claimed_until = NONE OR claimed_until < $now)
                    RETURN AFTER
                    "#,
                )
                .bind(("id", schedule.id.clone()))
                .bind(("version", schedule.version))
                .bind(("lease_token", token.to_string()))
                .bind(("now", Datetime::from(now)))
                .bind(("lease_until", Datetime::from(lease_until)))
                .await?;
            res.take(0)
        }
        .await;

        match attempt {
            Ok(claimed) => Ok(claimed.into_iter().next()),
            Err(e) if is_conflict(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record a run and drop the lease held under `token`.
    pub async fn advance_and_release(
        db: &Db,
        id: &RecordId,
        token: &str,
        now: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool> {
        let updated: Vec<ScheduleRecord> = retry_on_conflict(|| async move {
            let mut res = db
                .query(
                    r#"
                    UPDATE $id SET
                        next_run_at = $next_run_at,
                        last_run_at = $now,
                        claimed_until = NONE,
                        claim_token = NONE,
                        updated_at = $now
                    WHERE claim_token = $lease_token
                    RETURN AFTER
                    "#,
                )
                .bind(("id", id.clone()))
                .bind(("lease_token", token.to_string()))
                .bind(("now", Datetime::from(now)))
                .bind(("next_run_at", Datetime::from(next_run_at)))
                .await?;
            res.take(0)
        })
        .await?;

        Ok(!updated.is_empty())
    }

    /// Drop the lease without touching `next_run_at`.
    pub async fn release(db: &Db, id: &RecordId, token: &str) -> Result<()> {
        let _: Vec<ScheduleRecord> = retry_on_conflict(|| async move {
            let mut res = db
                .query(
                    r#"
                    UPDATE $id SET claimed_until = NONE, claim_token = NONE
                    WHERE claim_token = $lease_token
                    RETURN AFTER
                    "#,
                )
                .bind(("id", id.clone()))
                .bind(("lease_token", token.to_string()))
                .await?;
            res.take(0)
        })
        .await?;

        Ok(())
    }
}

pub struct ExecutionStore;

impl ExecutionStore {
    /// Insert a PENDING execution.
    pub async fn insert_pending(
        db: &Db,
        schedule_id: Option<&RecordId>,
        plugin_name: &str,
        params: &Value,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ExecutionRecord> {
        let created: Option<ExecutionRecord> = retry_on_conflict(|| async move {
            let mut res = db
                .query(
                    r#"
                    CREATE type::thing("execution", $key) CONTENT {
                        schedule_id: $schedule_id,
                        plugin_name: $plugin_name,
                        user_id: $user_id,
                        params: $params,
                        result: NONE,
                        status: "PENDING",
                        error: NONE,
                        started_at: NONE,
                        completed_at: NONE,
                        version: 0,
                        created_at: $now,
                        updated_at: $now
                    }
                    "#,
                )
                .bind(("key", new_key()))
                .bind(("schedule_id", schedule_id.cloned()))
                .bind(("plugin_name", plugin_name.to_string()))
                .bind(("user_id", user_id.to_string()))
                .bind(("params", params.clone()))
                .bind(("now", Datetime::from(now)))
                .await?;
            res.take(0)
        })
        .await?;

        created.ok_or_else(|| anyhow!("failed to create execution record"))
    }

    /// Queue an ad hoc run that is not tied to any schedule.
    pub async fn create_adhoc(db: &Db, data: &ExecutionCreate) -> Result<ExecutionRecord> {
        ensure!(!data.plugin_name.trim().is_empty(), "plugin_name must not be empty");
        ensure!(!data.user_id.trim().is_empty(), "user_id must not be empty");
        Self::insert_pending(db, None, &data.plugin_name, &data.params, &data.user_id, Utc::now())
            .await
    }

    pub async fn get(db: &Db, id: &RecordId) -> Result<Option<ExecutionRecord>> {
        let mut res = db
            .query("SELECT * FROM execution WHERE id = $id LIMIT 1")
            .bind(("id", id.clone()))
            .await?;

        let execution: Option<ExecutionRecord> = res.take(0)?;
        Ok(execution)
    }

    /// Newest-first listing, filtered by whichever fields are set.
    pub async fn list(db: &Db, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        let mut conditions = Vec::new();
        if filter.schedule_id.is_some() {
            conditions.push("schedule_id = $schedule_id");
        }
        if filter.plugin_name.is_some() {
            conditions.push("plugin_name = $plugin_name");
        }
        if filter.status.is_some() {
            conditions.push("status = $status");
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let query = format!(
            "SELECT * FROM execution {} ORDER BY created_at DESC LIMIT $limit",
            where_clause
        );

        let mut res = db
            .query(query)
            .bind(("schedule_id", filter.schedule_id.clone()))
            .bind(("plugin_name", filter.plugin_name.clone()))
            .bind(("status", filter.status.map(|s| s.as_str().to_string())))
            .bind(("limit", filter.limit.unwrap_or(100) as i64))
            .await?;

        let executions: Vec<ExecutionRecord> = res.take(0)?;
        Ok(executions)
    }

    /// Whether the schedule has a PENDING or RUNNING execution.
    pub async fn has_outstanding(db: &Db, schedule_id: &RecordId) -> Result<bool> {
        let mut res = db
            .query(
                r#"
                SELECT VALUE id FROM execution
                WHERE schedule_id = $schedule_id
                  AND status IN ["PENDING", "RUNNING"]
                LIMIT 1
                "#,
            )
            .bind(("schedule_id", schedule_id.clone()))
            .await?;

        let open: Vec<RecordId> = res.take(0)?;
        Ok(!open.is_empty())
    }

    /// PENDING executions whose eligibility time (if any) has passed.
    pub async fn find_claimable(
        db: &Db,
        now: DateTime<Utc>,
        limit: u32,
        schedule_id: Option<&RecordId>,
    ) -> Result<Vec<ExecutionRecord>> {
        let schedule_filter = if schedule_id.is_some() {
            "AND schedule_id = $schedule_id"
        } else {
            ""
        };
        let query = format!(
            r#"
            SELECT * FROM execution
            WHERE status = "PENDING"
              AND (started_at = NONE OR started_at <= $now)
              {}
            ORDER BY created_at ASC
            LIMIT $limit
            "#,
            schedule_filter
        );

        let mut res = db
            .query(query)
            .bind(("now", Datetime::from(now)))
            .bind(("limit", limit as i64))
            .bind(("schedule_id", schedule_id.cloned()))
            .await?;

        let executions: Vec<ExecutionRecord> = res.take(0)?;
        Ok(executions)
    }

    /// PENDING -> RUNNING if the row is still at the version we read.
    pub async fn try_claim(
        db: &Db,
        execution: &ExecutionRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>> {
        let attempt: surrealdb::Result<Vec<ExecutionRecord>> = async {
            let mut res = db
                .query(
                    r#"
                    UPDATE $id SET
                        status = "RUNNING",
                        started_at = $now,
                        error = NONE,
                        version += 1,
                        updated_at = $now
                    WHERE status = "PENDING"
                      AND version = $version
                      AND (started_at = NONE OR started_at <= $now)
                    RETURN AFTER
                    "#,
                )
                .bind(("id", execution.id.clone()))
                .bind(("version", execution.version))
                .bind(("now", Datetime::from(now)))
                .await?;
            res.take(0)
        }
        .await;

        match attempt {
            Ok(claimed) => Ok(claimed.into_iter().next()),
            Err(e) if is_conflict(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// RUNNING -> COMPLETED. Returns false if the row moved on (e.g. reaped).
    pub async fn mark_completed(
        db: &Db,
        claimed: &ExecutionRecord,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = &result;
        let updated: Vec<ExecutionRecord> = retry_on_conflict(|| async move {
            let mut res = db
                .query(
                    r#"
                    UPDATE $id SET
                        status = "COMPLETED",
                        result = $result,
                        error = NONE,
                        completed_at = $now,
                        version += 1,
                        updated_at = $now
                    WHERE status = "RUNNING" AND version = $version
                    RETURN AFTER
                    "#,
                )
                .bind(("id", claimed.id.clone()))
                .bind(("version", claimed.version))
                .bind(("result", result.clone()))
                .bind(("now", Datetime::from(now)))
                .await?;
            res.take(0)
        })
        .await?;

        Ok(!updated.is_empty())
    }

    /// RUNNING -> FAILED with the executor's message.
    pub async fn mark_failed(
        db: &Db,
        claimed: &ExecutionRecord,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated: Vec<ExecutionRecord> = retry_on_conflict(|| async move {
            let mut res = db
                .query(
                    r#"
                    UPDATE $id SET
                        status = "FAILED",
                        error = $error,
                        completed_at = $now,
                        version += 1,
                        updated_at = $now
                    WHERE status = "RUNNING" AND version = $version
                    RETURN AFTER
                    "#,
                )
                .bind(("id", claimed.id.clone()))
                .bind(("version", claimed.version))
                .bind(("error", error.to_string()))
                .bind(("now", Datetime::from(now)))
                .await?;
            res.take(0)
        })
        .await?;

        Ok(!updated.is_empty())
    }

    /// RUNNING -> PENDING, not claimable again before `eligible_at`.
    pub async fn mark_deferred(
        db: &Db,
        claimed: &ExecutionRecord,
        reason: &str,
        eligible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated: Vec<ExecutionRecord> = retry_on_conflict(|| async move {
            let mut res = db
                .query(
                    r#"
                    UPDATE $id SET
                        status = "PENDING",
                        error = $error,
                        started_at = $eligible_at,
                        completed_at = NONE,
                        version += 1,
                        updated_at = $now
                    WHERE status = "RUNNING" AND version = $version
                    RETURN AFTER
                    "#,
                )
                .bind(("id", claimed.id.clone()))
                .bind(("version", claimed.version))
                .bind(("error", format!("deferred: {}", reason)))
                .bind(("eligible_at", Datetime::from(eligible_at)))
                .bind(("now", Datetime::from(now)))
                .await?;
            res.take(0)
        })
        .await?;

        Ok(!updated.is_empty())
    }

    /// Fail every RUNNING execution claimed before `cutoff`.
    pub async fn fail_stale(
        db: &Db,
        cutoff: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>> {
        retry_on_conflict(|| async move {
            let mut res = db
                .query(
                    r#"
                    UPDATE execution SET
                        status = "FAILED",
                        error = $error,
                        completed_at = $now,
                        version += 1,
                        updated_at = $now
                    WHERE status = "RUNNING" AND started_at < $cutoff
                    RETURN AFTER
                    "#,
                )
                .bind(("cutoff", Datetime::from(cutoff)))
                .bind(("error", error.to_string()))
                .bind(("now", Datetime::from(now)))
                .await?;
            res.take(0)
        })
        .await
    }
}
