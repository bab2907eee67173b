use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use surrealdb::{RecordId, sql::Datetime};

/// Persisted recurring job definition (table: `schedule`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    #[serde(serialize_with = "serialize_record_key")]
    pub id: RecordId,
    /// Plugin invoked for every execution of this schedule.
    pub plugin_name: String,
    /// Opaque payload passed through to the executor.
    #[serde(default)]
    pub params: Value,
    pub interval_seconds: i64,
    pub enabled: bool,
    /// Owner used as the execution user; falls back to the caller-supplied
    /// user when absent.
    pub owner_user_id: Option<String>,
    /// `None` or a time at or before now means the schedule is due.
    pub next_run_at: Option<Datetime>,
    pub last_run_at: Option<Datetime>,
    /// Enqueue lease; rows leased into the future are skipped by other claimers.
    #[serde(skip_serializing)]
    pub claimed_until: Option<Datetime>,
    #[serde(skip_serializing)]
    pub claim_token: Option<String>,
    #[serde(default)]
    pub version: i64,
    pub created_at: Option<Datetime>,
    pub updated_at: Option<Datetime>,
}

impl ScheduleRecord {
    /// Key part of the record id, as used in admin URLs.
    pub fn key(&self) -> String {
        record_key(&self.id)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.as_ref().is_none_or(|at| to_utc(at) <= now)
    }
}

/// Payload used when inserting a new schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleCreate {
    pub plugin_name: String,
    #[serde(default)]
    pub params: Value,
    pub interval_seconds: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub owner_user_id: Option<String>,
    /// First run time; `None` makes the schedule due immediately.
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

/// Partial update for a schedule. Absent fields are left untouched.
///
/// `owner_user_id` and `next_run_at` are doubly optional so that an explicit
/// `null` clears the stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    #[serde(default)]
    pub plugin_name: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub interval_seconds: Option<i64>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub owner_user_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub next_run_at: Option<Option<DateTime<Utc>>>,
}

fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Lifecycle status of an execution.
///
/// PENDING -> RUNNING -> COMPLETED | FAILED, with RUNNING -> PENDING on
/// deferral and RUNNING -> FAILED from the stale reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// PENDING and RUNNING count as outstanding for single-flight purposes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("unknown execution status `{}`", other)),
        }
    }
}

/// Persisted execution record (table: `execution`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    #[serde(serialize_with = "serialize_record_key")]
    pub id: RecordId,
    /// `None` for ad hoc runs.
    #[serde(serialize_with = "serialize_optional_record_key")]
    pub schedule_id: Option<RecordId>,
    pub plugin_name: String,
    pub user_id: String,
    #[serde(default)]
    pub params: Value,
    /// Executor payload on success.
    #[serde(default)]
    pub result: Option<Value>,
    pub status: ExecutionStatus,
    /// Failure message, or `deferred: ...` while waiting out a rate limit.
    pub error: Option<String>,
    /// Claim time while RUNNING; earliest next claim time while deferred.
    pub started_at: Option<Datetime>,
    pub completed_at: Option<Datetime>,
    #[serde(default)]
    pub version: i64,
    pub created_at: Option<Datetime>,
    pub updated_at: Option<Datetime>,
}

impl ExecutionRecord {
    pub fn key(&self) -> String {
        record_key(&self.id)
    }
}

/// Payload for an ad hoc execution that is not tied to a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionCreate {
    pub plugin_name: String,
    pub user_id: String,
    #[serde(default)]
    pub params: Value,
}

/// Filter for listing executions. Empty filter lists everything up to `limit`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    pub schedule_id: Option<RecordId>,
    pub plugin_name: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<u32>,
}

pub fn to_utc(dt: &Datetime) -> DateTime<Utc> {
    DateTime::<Utc>::from(dt.clone())
}

/// Strip the table prefix (and any escaping) from a record id.
pub fn record_key(id: &RecordId) -> String {
    let raw = id.to_string();
    let key = raw.split_once(':').map(|(_, key)| key).unwrap_or(&raw);
    key.trim_matches(|c| c == '⟨' || c == '⟩' || c == '`').to_string()
}

fn serialize_record_key<S: Serializer>(id: &RecordId, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&record_key(id))
}

fn serialize_optional_record_key<S: Serializer>(
    id: &Option<RecordId>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match id {
        Some(id) => serializer.serialize_str(&record_key(id)),
        None => serializer.serialize_none(),
    }
}
