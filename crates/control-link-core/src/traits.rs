//! Core traits for operations and outbound delivery.

use std::{fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure reported by a registered operation.
///
/// The message is relayed verbatim to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct OperationError {
    message: String,
}

impl OperationError {
    /// Create an operation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for OperationError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for OperationError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Trait for registered operations.
///
/// An operation maps a parameter record to an eventual result and signals
/// failure only through `Err`. No schema is imposed on either side beyond
/// being JSON.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Execute the operation.
    async fn execute(&self, params: Value) -> Result<Value, OperationError>;
}

/// Operation backed by an async closure.
pub struct FnOperation<F> {
    f: F,
}

impl<F> fmt::Debug for FnOperation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Operation for FnOperation<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, OperationError>> + Send + 'static,
{
    async fn execute(&self, params: Value) -> Result<Value, OperationError> {
        (self.f)(params).await
    }
}

/// Wrap an async closure as a shared operation.
pub fn operation_fn<F, Fut>(f: F) -> Arc<dyn Operation>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, OperationError>> + Send + 'static,
{
    Arc::new(FnOperation { f })
}

/// Outbound delivery error.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Not connected")]
    NotConnected,
    #[error("Failed to encode message: {0}")]
    Encode(String),
}

/// Destination for outbound messages (responses, status, queue events).
///
/// Implementations must check liveness on every call; a message that cannot
/// be delivered is reported, never buffered.
pub trait MessageSink: Send + Sync {
    /// Send one message.
    ///
    /// # Errors
    /// Returns error if the destination is down or the message cannot be encoded.
    fn send(&self, message: &Value) -> Result<(), SinkError>;
}

/// Sink forwarding into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Value>,
}

impl ChannelSink {
    /// Create a sink and the receiving end.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageSink for ChannelSink {
    fn send(&self, message: &Value) -> Result<(), SinkError> {
        self.tx
            .send(message.clone())
            .map_err(|_| SinkError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_test::assert_ok;

    use super::*;

    #[tokio::test]
    async fn test_fn_operation_passes_params() {
        let op = operation_fn(|params: Value| async move { Ok(json!({ "echo": params })) });
        let result = assert_ok!(op.execute(json!({ "a": 1 })).await);
        assert_eq!(result, json!({ "echo": { "a": 1 } }));
    }

    #[tokio::test]
    async fn test_fn_operation_rejects() {
        let op = operation_fn(|_| async { Err(OperationError::new("element not found")) });
        let err = op.execute(Value::Null).await.unwrap_err();
        assert_eq!(err.to_string(), "element not found");
    }

    #[test]
    fn test_channel_sink_reports_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        assert!(sink.send(&json!({ "x": 1 })).is_ok());
        drop(rx);
        assert!(matches!(
            sink.send(&json!({ "x": 2 })),
            Err(SinkError::NotConnected)
        ));
    }
}
