//! Events broadcast to in-process observers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{LinkStatus, SessionSnapshot, TaskRecord};

/// Local event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocalEvent {
    /// Session state changed.
    Session(SessionSnapshot),
    /// Status transition, mirrored from what the controller is told.
    Status {
        status: LinkStatus,
        data: Value,
        timestamp: i64,
    },
    /// A task record was created or settled.
    Task(TaskRecord),
    /// A named queue finished or was cancelled.
    QueueFinished {
        queue_id: String,
        status: String,
        summary: Value,
    },
}

impl LocalEvent {
    /// Event name used for SSE framing.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Session(_) => "session",
            Self::Status { .. } => "status",
            Self::Task(_) => "task",
            Self::QueueFinished { .. } => "queue_finished",
        }
    }

    /// Render as an SSE event (requires `sse` feature).
    #[cfg(feature = "sse")]
    #[must_use]
    pub fn to_sse_event(&self) -> axum::response::sse::Event {
        use axum::response::sse::Event;

        match serde_json::to_string(self) {
            Ok(json) => Event::default().event(self.name()).data(json),
            Err(e) => Event::default().event("error").data(e.to_string()),
        }
    }
}
