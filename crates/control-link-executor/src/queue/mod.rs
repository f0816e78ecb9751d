//! Queue engine: one-shot batches and long-lived named queues.

mod batch;
mod commands;
mod engine;
mod step;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use batch::{BatchOptions, BatchResult, run_batch};
pub use commands::register_queue_commands;
pub use engine::{QueueEngine, QueueError, QueueOptions};
pub use step::execute_step;

/// Named queue status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Running,
    Completed,
    Cancelled,
}

/// Status of a single queued step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

/// A step as submitted: `{type, params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub params: Value,
}

impl StepSpec {
    #[must_use]
    pub fn new(command_type: impl Into<String>, params: Value) -> Self {
        Self {
            command_type: command_type.into(),
            params,
        }
    }
}

/// One step of a batch or queue.
///
/// `Completed` and `Failed` are reached only by invoking the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCommand {
    pub index: usize,
    #[serde(rename = "type")]
    pub command_type: String,
    pub params: Value,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

impl QueueCommand {
    pub(crate) fn pending(index: usize, spec: StepSpec) -> Self {
        Self {
            index,
            command_type: spec.command_type,
            params: spec.params,
            status: StepStatus::Pending,
            result: None,
            error: None,
            start_time: None,
            end_time: None,
        }
    }

    pub(crate) fn start(&mut self, now: i64) {
        self.status = StepStatus::Running;
        self.start_time = Some(now);
    }

    pub(crate) fn settle(&mut self, outcome: Result<Value, String>, now: i64) {
        match outcome {
            Ok(result) => {
                self.status = StepStatus::Completed;
                self.result = Some(result);
            }
            Err(error) => {
                self.status = StepStatus::Failed;
                self.error = Some(error);
            }
        }
        self.end_time = Some(now);
    }
}

/// Per-status counts plus timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub elapsed_ms: i64,
    /// Fraction of steps that have settled, 0.0 to 1.0.
    pub progress: f64,
}

impl QueueSummary {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_steps(steps: &[QueueCommand], elapsed_ms: i64) -> Self {
        let count = |status| steps.iter().filter(|s| s.status == status).count();
        let total = steps.len();
        let pending = count(StepStatus::Pending);
        let running = count(StepStatus::Running);
        let progress = if total == 0 {
            1.0
        } else {
            (total - pending - running) as f64 / total as f64
        };
        Self {
            total,
            pending,
            running,
            completed: count(StepStatus::Completed),
            failed: count(StepStatus::Failed),
            cancelled: count(StepStatus::Cancelled),
            skipped: count(StepStatus::Skipped),
            elapsed_ms,
            progress,
        }
    }
}

/// Named queue record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    pub id: String,
    pub status: QueueStatus,
    pub commands: Vec<QueueCommand>,
    pub current_index: usize,
    pub cancelled: bool,
    pub delay_ms: u64,
    pub timeout_ms: u64,
    pub stop_on_error: bool,
    pub start_time: i64,
    pub end_time: Option<i64>,
}

impl Queue {
    /// Summary as of `now`.
    #[must_use]
    pub fn summary(&self, now: i64) -> QueueSummary {
        let elapsed = self.end_time.unwrap_or(now) - self.start_time;
        QueueSummary::from_steps(&self.commands, elapsed)
    }
}

/// Queue snapshot with its summary, as reported to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueReport {
    #[serde(flatten)]
    pub queue: Queue,
    pub summary: QueueSummary,
}

/// Outbound completion event: `{type: "queue_completed", queueId, status, summary, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "queue_completed", rename_all = "camelCase")]
pub struct QueueCompleted {
    pub queue_id: String,
    pub status: QueueStatus,
    pub summary: QueueSummary,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_summary_counts_and_progress() {
        let mut steps: Vec<QueueCommand> = (0..4)
            .map(|i| QueueCommand::pending(i, StepSpec::new("t", Value::Null)))
            .collect();
        steps[0].settle(Ok(json!(1)), 10);
        steps[1].settle(Err("boom".to_string()), 20);
        steps[2].start(20);

        let summary = QueueSummary::from_steps(&steps, 20);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.running, 1);
        assert_eq!(summary.pending, 1);
        assert!((summary.progress - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_queue_completed_wire_shape() {
        let event = QueueCompleted {
            queue_id: "queue_1".to_string(),
            status: QueueStatus::Cancelled,
            summary: QueueSummary::from_steps(&[], 0),
            timestamp: 9,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "queue_completed");
        assert_eq!(value["queueId"], "queue_1");
        assert_eq!(value["status"], "cancelled");
        assert_eq!(value["summary"]["progress"], 1.0);
    }
}
