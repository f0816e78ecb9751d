//! Session state vocabulary shared by the transport and local observers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection phase of the transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No connection and none being opened.
    #[default]
    Disconnected,
    /// Connection is being opened.
    Connecting,
    /// Connection is open and the auth handshake is running.
    Authenticating,
    /// Connection is usable.
    Connected,
}

impl Phase {
    /// Whether a connection handle may exist in this phase.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Status values reported to the controller and to local observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Connected,
    Disconnected,
    Reconnecting,
    /// Reconnect attempts exhausted, or the link cannot be configured.
    Failed,
    /// The access policy vetoed the target address.
    Blocked,
    AuthFailed,
}

/// Point-in-time view of the transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub authenticated: bool,
    pub encryption_enabled: bool,
    pub reconnect_attempts: u32,
    /// An active connection handle is held.
    pub has_connection: bool,
}
