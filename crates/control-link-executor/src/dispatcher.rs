//! Command dispatcher.
//!
//! Turns one inbound envelope into exactly one response. Nothing escapes:
//! malformed input, unknown types, validator rejections, and operation
//! failures all become `success: false` responses.

use std::sync::Arc;

use control_link_core::{MessageSink, SharedClock};
use serde_json::Value;

use crate::{
    envelope::{CommandEnvelope, CommandResponse, raw_command_id},
    history::TaskHistory,
    registry::{OperationRegistry, invoke},
    validation::ValidationError,
};

/// Command dispatcher.
pub struct CommandDispatcher {
    registry: Arc<OperationRegistry>,
    history: Arc<TaskHistory>,
    sink: Arc<dyn MessageSink>,
    clock: SharedClock,
}

impl CommandDispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<OperationRegistry>,
        history: Arc<TaskHistory>,
        sink: Arc<dyn MessageSink>,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            history,
            sink,
            clock,
        }
    }

    /// Handle a message and send the response.
    ///
    /// If the sink is down the response is logged and dropped.
    pub async fn dispatch(&self, raw: Value) {
        let response = self.handle(raw).await;
        self.respond(&response);
    }

    /// Handle a message and return the response without sending it.
    pub async fn handle(&self, raw: Value) -> CommandResponse {
        let envelope = match CommandEnvelope::parse(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                let command_id = raw_command_id(&raw);
                tracing::warn!(?command_id, error = %e, "Rejected malformed command");
                return self.failure(command_id, &e);
            }
        };

        let CommandEnvelope {
            command_id,
            command_type,
            mut params,
            ..
        } = envelope;

        let Some(registered) = self.registry.resolve(&command_type) else {
            tracing::warn!(%command_id, %command_type, "Unknown command type");
            return self.failure(Some(command_id), &ValidationError::UnknownType(command_type));
        };

        if let Some(validator) = &registered.validator {
            if let Err(e) = validator.validate(&mut params) {
                tracing::warn!(%command_id, %command_type, error = %e, "Command failed validation");
                return self.failure(Some(command_id), &e);
            }
        }

        let handle = self.history.begin(&command_id, &command_type, params.clone());
        tracing::debug!(%command_id, %command_type, "Executing command");

        match invoke(registered.operation, params).await {
            Ok(result) => {
                self.history.finish(handle, None);
                tracing::debug!(%command_id, "Command completed");
                CommandResponse::success(command_id, result, self.clock.now_millis())
            }
            Err(e) => {
                let message = e.message().to_string();
                tracing::warn!(%command_id, %command_type, error = %message, "Command failed");
                self.history.finish(handle, Some(message.clone()));
                CommandResponse::failure(Some(command_id), message, self.clock.now_millis())
            }
        }
    }

    fn failure(&self, command_id: Option<String>, error: &ValidationError) -> CommandResponse {
        CommandResponse::failure(command_id, error.to_string(), self.clock.now_millis())
    }

    fn respond(&self, response: &CommandResponse) {
        let message = match serde_json::to_value(response) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("Failed to serialize response: {e}");
                return;
            }
        };
        if let Err(e) = self.sink.send(&message) {
            tracing::warn!(
                command_id = ?response.command_id,
                error = %e,
                "Response dropped, transport unavailable"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use control_link_core::{
        ChannelSink, ManualClock, OperationError, SinkError, TaskStatus, operation_fn,
    };
    use serde_json::json;

    use super::*;
    use crate::validation::RequireUrl;

    struct Fixture {
        dispatcher: CommandDispatcher,
        history: Arc<TaskHistory>,
        rx: tokio::sync::mpsc::UnboundedReceiver<Value>,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(5_000);
        let registry = Arc::new(OperationRegistry::new());
        registry.register(
            "echo",
            operation_fn(|params| async move { Ok(json!({ "echo": params })) }),
        );
        registry.register(
            "fail",
            operation_fn(|_| async { Err(OperationError::new("element not found")) }),
        );
        registry.register_validated(
            "navigate",
            operation_fn(|_| async { Ok(json!({ "loaded": true })) }),
            RequireUrl::new("url"),
        );
        let history = Arc::new(TaskHistory::new(clock.clone()));
        let (sink, rx) = ChannelSink::new();
        Fixture {
            dispatcher: CommandDispatcher::new(registry, history.clone(), Arc::new(sink), clock),
            history,
            rx,
        }
    }

    #[tokio::test]
    async fn test_success_response() {
        let mut f = fixture();
        f.dispatcher
            .dispatch(json!({ "command_id": "c1", "type": "echo", "params": { "a": 1 } }))
            .await;

        let response = f.rx.recv().await.unwrap();
        assert_eq!(
            response,
            json!({
                "command_id": "c1",
                "success": true,
                "result": { "echo": { "a": 1 } },
                "error": null,
                "timestamp": 5_000
            })
        );
        assert_eq!(f.history.get("c1").unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_operation_failure_is_recorded() {
        let mut f = fixture();
        f.dispatcher
            .dispatch(json!({ "command_id": "c2", "type": "fail" }))
            .await;

        let response = f.rx.recv().await.unwrap();
        assert_eq!(response["success"], false);
        assert_eq!(response["error"], "element not found");
        assert_eq!(response["result"], Value::Null);

        let record = f.history.get("c2").unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("element not found"));
    }

    #[tokio::test]
    async fn test_unknown_type_creates_no_record() {
        let f = fixture();
        let response = f
            .dispatcher
            .handle(json!({ "command_id": "c3", "type": "teleport" }))
            .await;
        assert!(!response.success);
        assert_eq!(response.command_id.as_deref(), Some("c3"));
        assert!(response.error.unwrap().contains("teleport"));
        assert!(f.history.is_empty());
    }

    #[tokio::test]
    async fn test_validation_failure_short_circuits() {
        let f = fixture();
        let response = f
            .dispatcher
            .handle(json!({
                "command_id": "c4",
                "type": "navigate",
                "params": { "url": "file:///etc/passwd" }
            }))
            .await;
        assert!(!response.success);
        assert!(f.history.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_envelope_keeps_command_id() {
        let f = fixture();
        let response = f
            .dispatcher
            .handle(json!({ "command_id": "c5", "params": {} }))
            .await;
        assert_eq!(response.command_id.as_deref(), Some("c5"));
        assert_eq!(response.error.as_deref(), Some("Missing required field: type"));

        let response = f
            .dispatcher
            .handle(json!({ "command_id": 42, "type": "echo" }))
            .await;
        assert_eq!(response.command_id.as_deref(), Some("42"));
        assert_eq!(
            response.error.as_deref(),
            Some("Invalid field command_id: must be a string")
        );
        assert!(f.history.is_empty());

        let response = f.dispatcher.handle(json!("garbage")).await;
        assert_eq!(response.command_id, None);
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_response_dropped_when_sink_down() {
        struct DownSink;
        impl MessageSink for DownSink {
            fn send(&self, _message: &Value) -> Result<(), SinkError> {
                Err(SinkError::NotConnected)
            }
        }

        let clock = ManualClock::new(0);
        let registry = Arc::new(OperationRegistry::new());
        registry.register("echo", operation_fn(|p| async move { Ok(p) }));
        let history = Arc::new(TaskHistory::new(clock.clone()));
        let dispatcher =
            CommandDispatcher::new(registry, history.clone(), Arc::new(DownSink), clock);

        dispatcher
            .dispatch(json!({ "command_id": "c6", "type": "echo" }))
            .await;
        // The operation still ran and was recorded.
        assert_eq!(history.get("c6").unwrap().status, TaskStatus::Completed);
    }
}
