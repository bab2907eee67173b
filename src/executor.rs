//! Contract with the external plugin execution engine.
//!
//! The scheduler knows nothing about what plugins do. It only tells apart a
//! successful result, a rate-limit signal carrying a backoff, and any other
//! failure.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Backoff used when a 429 carries no usable retry hint.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Longest backoff honoured from a rate-limit response.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(7 * 24 * 3600);

/// One invocation handed to the execution engine.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub plugin_name: String,
    pub params: Value,
    pub user_id: String,
    /// Identifies the scheduler to the engine, if configured.
    pub agent_key: Option<String>,
}

/// Failures the execution engine can report.
#[derive(Debug, Clone)]
pub enum ExecutorError {
    /// Downstream asked us to back off. The execution is deferred, not failed.
    RateLimited {
        status: u16,
        retry_after: Duration,
        reason: String,
    },

    /// Anything else. The execution is failed with this message.
    Failed(String),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited {
                status,
                retry_after,
                reason,
            } => write!(
                f,
                "rate limited ({}), retry after {}s: {}",
                status,
                retry_after.as_secs(),
                reason
            ),
            Self::Failed(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ExecutorError {}

impl From<anyhow::Error> for ExecutorError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

impl ExecutorError {
    pub fn rate_limited(retry_after: Duration, reason: impl Into<String>) -> Self {
        Self::RateLimited {
            status: 429,
            retry_after,
            reason: reason.into(),
        }
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

#[async_trait]
pub trait PluginExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<Value, ExecutorError>;
}

/// Executor that forwards to an HTTP execution engine.
///
/// `POST {base_url}/plugins/{plugin_name}/execute` with
/// `{"params": ..., "user_id": ...}`; the JSON response body is the result.
pub struct HttpPluginExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPluginExecutor {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PluginExecutor for HttpPluginExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<Value, ExecutorError> {
        let url = format!("{}/plugins/{}/execute", self.base_url, request.plugin_name);

        let mut builder = self.client.post(&url).json(&serde_json::json!({
            "params": request.params,
            "user_id": request.user_id,
        }));
        if let Some(key) = &request.agent_key {
            builder = builder.header("X-Agent-Key", key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ExecutorError::failed(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        let retry_header = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response.text().await.unwrap_or_default();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let parsed: Option<Value> = serde_json::from_str(&body).ok();
            let retry_after = retry_after_from(retry_header.as_deref(), parsed.as_ref());
            let reason = parsed
                .as_ref()
                .and_then(|v| v.get("detail").or_else(|| v.get("error")))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| "rate limited".to_string());

            return Err(ExecutorError::RateLimited {
                status: status.as_u16(),
                retry_after,
                reason,
            });
        }

        if !status.is_success() {
            return Err(ExecutorError::failed(format!(
                "plugin `{}` returned {}: {}",
                request.plugin_name, status, body
            )));
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| ExecutorError::failed(format!("invalid JSON from executor: {}", e)))
    }
}

/// Backoff from a `Retry-After` header (delta-seconds) or a `retry_after`
/// body field, capped at [`MAX_RETRY_AFTER`], falling back to
/// [`DEFAULT_RETRY_AFTER`].
pub fn retry_after_from(header: Option<&str>, body: Option<&Value>) -> Duration {
    if let Some(secs) = header.and_then(|h| h.trim().parse::<u64>().ok()) {
        return Duration::from_secs(secs).min(MAX_RETRY_AFTER);
    }

    body.and_then(|b| b.get("retry_after"))
        .and_then(|v| v.as_f64())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| Duration::from_secs_f64(secs.min(MAX_RETRY_AFTER.as_secs_f64())))
        .unwrap_or(DEFAULT_RETRY_AFTER)
}
