//! Core abstractions for the agent control channel.
//!
//! This crate provides the shared building blocks:
//! - `LinkConfig` - Recognized options and the reconnect backoff policy
//! - `Clock` - Injectable wall-clock source
//! - `EventStore` - Broadcast + history for local observers
//! - `LocalEvent` - Typed local event enum
//! - `Operation` and `MessageSink` traits

pub mod clock;
pub mod config;
pub mod event;
pub mod event_store;
pub mod state;
pub mod task;
pub mod traits;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use self::config::{ConfigError, LinkConfig, load_config};
pub use event::LocalEvent;
pub use event_store::EventStore;
pub use state::{LinkStatus, Phase, SessionSnapshot};
pub use task::{TaskRecord, TaskStatus};
pub use traits::{
    ChannelSink, FnOperation, MessageSink, Operation, OperationError, SinkError, operation_fn,
};
