//! Turns due schedules into PENDING executions, at most one outstanding
//! execution per schedule.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{Db, ExecutionStore, ScheduleRecord, ScheduleStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueSummary {
    pub enqueued: u32,
    pub skipped: u32,
}

/// What happened to one claimed schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Enqueued,
    /// No owner and no fallback; left due for a later tick.
    OwnerMissing,
    /// A PENDING or RUNNING execution already exists.
    Outstanding,
}

pub struct Enqueuer {
    db: Db,
    claim_lease: Duration,
}

impl Enqueuer {
    pub fn new(db: Db, claim_lease: std::time::Duration) -> Self {
        Self {
            db,
            claim_lease: Duration::from_std(claim_lease).unwrap_or_else(|_| Duration::seconds(60)),
        }
    }

    /// Claim up to `limit` due schedules and create one PENDING execution for
    /// each that has a resolvable owner and nothing outstanding.
    ///
    /// Schedules another process is already claiming are skipped silently and
    /// are not counted in either bucket. A store error while claiming aborts
    /// the call.
    pub async fn enqueue_due_schedules(
        &self,
        limit: u32,
        fallback_user_id: Option<&str>,
    ) -> Result<EnqueueSummary> {
        let mut summary = EnqueueSummary::default();
        if limit == 0 {
            return Ok(summary);
        }

        let now = Utc::now();
        let lease_until = now.checked_add_signed(self.claim_lease).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let candidates = ScheduleStore::find_due(&self.db, now, limit).await?;

        for candidate in candidates {
            let token = Uuid::new_v4().to_string();
            let claimed = match ScheduleStore::try_claim(
                &self.db,
                &candidate,
                &token,
                now,
                lease_until,
            )
            .await
            {
                Ok(Some(claimed)) => claimed,
                Ok(None) => {
                    debug!(schedule_id = %candidate.id, "schedule claimed elsewhere");
                    continue;
                }
                // Not contention: the store rejected the claim itself.
                Err(e) => {
                    return Err(e.context(format!("failed to claim schedule {}", candidate.id)));
                }
            };

            match self.enqueue_claimed(&claimed, &token, fallback_user_id).await {
                Ok(Disposition::Enqueued) => summary.enqueued += 1,
                Ok(Disposition::OwnerMissing) | Ok(Disposition::Outstanding) => summary.skipped += 1,
                Err(e) => {
                    warn!(schedule_id = %claimed.id, error = %e, "failed to enqueue schedule");
                    if let Err(e) = ScheduleStore::release(&self.db, &claimed.id, &token).await {
                        warn!(schedule_id = %claimed.id, error = %e, "failed to release schedule claim");
                    }
                }
            }
        }

        if summary.enqueued > 0 || summary.skipped > 0 {
            info!(
                enqueued = summary.enqueued,
                skipped = summary.skipped,
                "enqueued due schedules"
            );
        }
        Ok(summary)
    }

    async fn enqueue_claimed(
        &self,
        schedule: &ScheduleRecord,
        token: &str,
        fallback_user_id: Option<&str>,
    ) -> Result<Disposition> {
        let owner = schedule
            .owner_user_id
            .as_deref()
            .filter(|o| !o.is_empty())
            .or(fallback_user_id.filter(|o| !o.is_empty()));

        let Some(owner) = owner else {
            debug!(schedule_id = %schedule.id, "schedule has no owner, leaving it due");
            ScheduleStore::release(&self.db, &schedule.id, token).await?;
            return Ok(Disposition::OwnerMissing);
        };

        // Re-check under the claim: a duplicate enqueue may have slipped in
        // between an earlier claim expiring and this one.
        if ExecutionStore::has_outstanding(&self.db, &schedule.id).await? {
            debug!(schedule_id = %schedule.id, "schedule already has an outstanding execution");
            ScheduleStore::release(&self.db, &schedule.id, token).await?;
            return Ok(Disposition::Outstanding);
        }

        let now = Utc::now();
        let next_run_at = Duration::try_seconds(schedule.interval_seconds)
            .and_then(|interval| now.checked_add_signed(interval))
            .ok_or_else(|| anyhow!("interval_seconds {} out of range", schedule.interval_seconds))?;
        let execution = ExecutionStore::insert_pending(
            &self.db,
            Some(&schedule.id),
            &schedule.plugin_name,
            &schedule.params,
            owner,
            now,
        )
        .await?;

        let advanced =
            ScheduleStore::advance_and_release(&self.db, &schedule.id, token, now, next_run_at)
                .await?;
        if !advanced {
            // Lease expired mid-enqueue and someone else holds it now. They
            // will see our execution as outstanding and skip.
            warn!(schedule_id = %schedule.id, "schedule lease lost before advancing next_run_at");
        }

        debug!(
            schedule_id = %schedule.id,
            execution_id = %execution.id,
            plugin = %schedule.plugin_name,
            "execution enqueued"
        );
        Ok(Disposition::Enqueued)
    }
}
