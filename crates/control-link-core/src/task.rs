//! Task records for the recent-command history.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Operation is executing.
    Running,
    /// Operation resolved.
    Completed,
    /// Operation rejected.
    Failed,
}

/// One dispatched command, kept for local observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    #[serde(rename = "command_id")]
    pub command_id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    pub params: Value,
    pub status: TaskStatus,
    /// Unix epoch milliseconds.
    pub start_time: i64,
    pub end_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskRecord {
    /// Create a running record.
    #[must_use]
    pub fn running(
        command_id: impl Into<String>,
        command_type: impl Into<String>,
        params: Value,
        start_time: i64,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            command_type: command_type.into(),
            params,
            status: TaskStatus::Running,
            start_time,
            end_time: None,
            error: None,
        }
    }

    /// Settle the record.
    pub fn finish(&mut self, end_time: i64, error: Option<String>) {
        self.status = if error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        self.end_time = Some(end_time);
        self.error = error;
    }
}
