//! Connection abstraction.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::TransportError;

/// Close codes sent by the agent.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// The controller rejected the auth request.
    pub const AUTH_REJECTED: u16 = 4001;
    /// The controller did not answer the auth request in time.
    pub const AUTH_TIMEOUT: u16 = 4002;
}

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: u16, reason: String },
}

impl Frame {
    /// Build a close frame.
    #[must_use]
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close {
            code,
            reason: reason.into(),
        }
    }
}

/// An open connection.
///
/// Dropping `outbound` or sending a close frame ends the connection; the
/// inbound channel closing means the peer is gone.
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

/// Trait for opening connections to the controller.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `url`.
    async fn connect(&self, url: &str) -> Result<Connection, TransportError>;
}
