//! Command execution for the agent control channel.
//!
//! Provides:
//! - Command envelope and response records
//! - Parameter validation building blocks
//! - Operation registry
//! - Bounded recent-task history
//! - Command dispatcher
//! - Queue engine (batches and named queues)

pub mod dispatcher;
pub mod envelope;
pub mod history;
pub mod queue;
pub mod registry;
pub mod validation;

pub use dispatcher::CommandDispatcher;
pub use envelope::{CommandEnvelope, CommandResponse};
pub use history::{TaskHandle, TaskHistory};
pub use queue::{
    BatchOptions, BatchResult, Queue, QueueCommand, QueueCompleted, QueueEngine, QueueError,
    QueueOptions, QueueReport, QueueStatus, QueueSummary, StepSpec, StepStatus,
    register_queue_commands,
};
pub use registry::{OperationRegistry, Registered};
pub use validation::{
    AllOf, InputScreen, ParamValidator, RequireShape, RequireString, RequireUrl, ValidationError,
};
