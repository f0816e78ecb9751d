//! Agent runtime for the control channel.
//!
//! Provides:
//! - `Agent` - one transport session wired to a dispatcher and queue engine
//! - Routing of inbound commands and periodic history/queue sweeps

pub mod agent;

pub use agent::{Agent, AgentBuilder, AgentError, SWEEP_INTERVAL};
