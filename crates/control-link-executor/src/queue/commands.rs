//! Built-in commands driving the queue engine.
//!
//! Registered like any other operation, so the controller reaches the engine
//! through ordinary command envelopes.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use control_link_core::{OperationError, operation_fn};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};

use super::{BatchOptions, QueueEngine, QueueOptions, StepSpec};
use crate::{registry::OperationRegistry, validation::RequireShape};

const fn default_parallel() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    commands: Vec<StepSpec>,
    #[serde(default = "default_parallel")]
    parallel: bool,
    #[serde(default, alias = "stopOnError")]
    stop_on_error: bool,
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CreateQueueRequest {
    commands: Vec<StepSpec>,
    #[serde(default)]
    delay: u64,
    timeout: Option<u64>,
    #[serde(default, alias = "stopOnError")]
    stop_on_error: bool,
}

#[derive(Debug, Deserialize)]
struct QueueTarget {
    #[serde(alias = "queueId")]
    queue_id: String,
}

#[derive(Debug, Deserialize)]
struct NoParams {}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, OperationError> {
    serde_json::from_value(params)
        .map_err(|e| OperationError::new(format!("invalid parameters: {e}")))
}

fn upgrade(engine: &Weak<QueueEngine>) -> Result<Arc<QueueEngine>, OperationError> {
    engine
        .upgrade()
        .ok_or_else(|| OperationError::new("queue engine is shut down"))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, OperationError> {
    serde_json::to_value(value).map_err(|e| OperationError::new(e.to_string()))
}

fn step_timeout(requested: Option<u64>, engine: &QueueEngine) -> Duration {
    requested
        .filter(|ms| *ms > 0)
        .map_or_else(|| engine.default_timeout(), Duration::from_millis)
}

/// Register `execute_batch`, `create_queue`, `get_queue_status`,
/// `cancel_queue`, and `list_queues`.
///
/// Results use camelCase field names, matching `queue_completed`. Parameters
/// accept either snake_case or camelCase.
///
/// The registry holds only a weak reference to the engine; the engine already
/// owns the registry.
pub fn register_queue_commands(registry: &OperationRegistry, engine: &Arc<QueueEngine>) {
    let weak = Arc::downgrade(engine);
    registry.register_validated(
        "execute_batch",
        operation_fn(move |params| {
            let engine = weak.clone();
            async move {
                let engine = upgrade(&engine)?;
                let request: BatchRequest = parse(params)?;
                let options = BatchOptions {
                    parallel: request.parallel,
                    stop_on_error: request.stop_on_error,
                    timeout: step_timeout(request.timeout, &engine),
                };
                to_value(&engine.run_batch(request.commands, options).await)
            }
        }),
        RequireShape::<BatchRequest>::new(),
    );

    let weak = Arc::downgrade(engine);
    registry.register_validated(
        "create_queue",
        operation_fn(move |params| {
            let engine = weak.clone();
            async move {
                let engine = upgrade(&engine)?;
                let request: CreateQueueRequest = parse(params)?;
                let options = QueueOptions {
                    delay: Duration::from_millis(request.delay),
                    timeout: step_timeout(request.timeout, &engine),
                    stop_on_error: request.stop_on_error,
                };
                let report = engine.create_queue(request.commands, options);
                Ok(json!({
                    "queueId": report.queue.id,
                    "status": report.queue.status,
                    "total": report.summary.total,
                }))
            }
        }),
        RequireShape::<CreateQueueRequest>::new(),
    );

    let weak = Arc::downgrade(engine);
    registry.register_validated(
        "get_queue_status",
        operation_fn(move |params| {
            let engine = weak.clone();
            async move {
                let target: QueueTarget = parse(params)?;
                let report = upgrade(&engine)?
                    .get_status(&target.queue_id)
                    .map_err(|e| OperationError::new(e.to_string()))?;
                to_value(&report)
            }
        }),
        RequireShape::<QueueTarget>::new(),
    );

    let weak = Arc::downgrade(engine);
    registry.register_validated(
        "cancel_queue",
        operation_fn(move |params| {
            let engine = weak.clone();
            async move {
                let target: QueueTarget = parse(params)?;
                let report = upgrade(&engine)?
                    .cancel(&target.queue_id)
                    .map_err(|e| OperationError::new(e.to_string()))?;
                to_value(&report)
            }
        }),
        RequireShape::<QueueTarget>::new(),
    );

    let weak = Arc::downgrade(engine);
    registry.register_validated(
        "list_queues",
        operation_fn(move |_params| {
            let engine = weak.clone();
            async move {
                let queues: Vec<Value> = upgrade(&engine)?
                    .list()
                    .into_iter()
                    .map(|report| {
                        json!({
                            "queueId": report.queue.id,
                            "status": report.queue.status,
                            "summary": report.summary,
                        })
                    })
                    .collect();
                Ok(json!({ "queues": queues }))
            }
        }),
        RequireShape::<NoParams>::new(),
    );
}
