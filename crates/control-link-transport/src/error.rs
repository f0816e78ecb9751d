//! Transport error.

use thiserror::Error;

use crate::{
    codec::CodecError,
    connection::close_code,
    credentials::CredentialError,
};

/// Transport error.
///
/// Every variant is non-fatal to the process; by the time one is returned the
/// session has already reported the matching status and scheduled whatever
/// follow-up (reconnect or nothing) applies.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to {url} blocked: {reason}")]
    Blocked { url: String, reason: String },
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),
    #[error("Authentication timed out after {0}ms")]
    AuthTimeout(u64),
    #[error("Encryption is required but no key is configured")]
    MissingEncryptionKey,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection attempt superseded")]
    Superseded,
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),
}

impl TransportError {
    /// Close code to send when this error ends a handshake.
    #[must_use]
    pub const fn close_code(&self) -> u16 {
        match self {
            Self::AuthTimeout(_) => close_code::AUTH_TIMEOUT,
            Self::AuthRejected(_) | Self::Credential(_) => close_code::AUTH_REJECTED,
            _ => close_code::NORMAL,
        }
    }

    /// Whether this is an authentication failure.
    #[must_use]
    pub const fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::AuthRejected(_) | Self::AuthTimeout(_) | Self::Credential(_)
        )
    }
}
