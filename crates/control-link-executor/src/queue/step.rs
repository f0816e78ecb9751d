//! Per-step execution shared by batches and named queues.

use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time;

use crate::{
    registry::{OperationRegistry, invoke},
    validation::ValidationError,
};

/// Resolve, validate, and run one step against a deadline.
///
/// The operation runs on its own task. If the deadline passes first the step
/// fails with a timeout message and the task is left running detached; it is
/// neither aborted nor retried.
///
/// # Errors
/// Returns the failure message: unknown type, validation, operation error,
/// or timeout.
pub async fn execute_step(
    registry: &OperationRegistry,
    command_type: &str,
    mut params: Value,
    timeout: Duration,
) -> Result<Value, String> {
    let registered = registry
        .resolve(command_type)
        .ok_or_else(|| ValidationError::UnknownType(command_type.to_string()).to_string())?;

    if params.is_null() {
        params = Value::Object(Map::new());
    }
    if let Some(validator) = &registered.validator {
        validator.validate(&mut params).map_err(|e| e.to_string())?;
    }

    let task = tokio::spawn(invoke(registered.operation, params));
    match time::timeout(timeout, task).await {
        Ok(Ok(outcome)) => outcome.map_err(|e| e.message().to_string()),
        Ok(Err(e)) => Err(format!("operation aborted: {e}")),
        Err(_) => {
            tracing::warn!(%command_type, timeout_ms = timeout.as_millis(), "Step timed out");
            Err(format!("timed out after {}ms", timeout.as_millis()))
        }
    }
}
