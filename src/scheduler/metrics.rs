//! Bounded ring of recent tick summaries for operational dashboards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;

use super::enqueue::EnqueueSummary;
use super::runner::RunSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickSummary {
    pub recorded_at: DateTime<Utc>,
    /// Executions failed by the stale reaper during this tick.
    pub reaped: usize,
    pub enqueue: EnqueueSummary,
    pub run: RunSummary,
}

pub struct MetricsRecorder {
    capacity: usize,
    entries: RwLock<VecDeque<TickSummary>>,
}

impl MetricsRecorder {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub async fn record(&self, summary: TickSummary) {
        let mut entries = self.entries.write().await;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(summary);
    }

    /// Up to `limit` most recent summaries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<TickSummary> {
        let entries = self.entries.read().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
