//! Credential material owned by the session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Credential error.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("No auth token available")]
    MissingToken,
    #[error("Token issuance failed: {0}")]
    IssuanceFailed(String),
}

/// Bearer token presented during the auth handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub value: String,
    /// Unix epoch milliseconds; `None` never expires.
    pub expires_at: Option<i64>,
}

impl AuthToken {
    /// Create a token.
    #[must_use]
    pub fn new(value: impl Into<String>, expires_at: Option<i64>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// Whether the token has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Symmetric key material for the encryption envelope.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey {
    value: String,
}

impl EncryptionKey {
    /// Create a key from raw material.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// Raw key material.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(***)")
    }
}

/// Credentials currently held by the session.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub auth_token: Option<AuthToken>,
    pub encryption_key: Option<EncryptionKey>,
}

impl Credentials {
    /// Build from bootstrap config values.
    #[must_use]
    pub fn from_config(config: &control_link_core::LinkConfig) -> Self {
        Self {
            auth_token: config
                .auth_token
                .as_ref()
                .map(|value| AuthToken::new(value.clone(), None)),
            encryption_key: config.encryption_key.as_ref().map(EncryptionKey::new),
        }
    }

    /// Token usable at `now`, if any.
    #[must_use]
    pub fn valid_token(&self, now: i64) -> Option<&AuthToken> {
        self.auth_token.as_ref().filter(|token| !token.is_expired(now))
    }
}

/// Trait for token issuance backends.
///
/// Consulted when the session holds no unexpired token at handshake time.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Issue a fresh token.
    async fn issue(&self) -> Result<AuthToken, CredentialError>;
}

/// Issuer that always hands out the same token.
#[derive(Debug, Clone)]
pub struct StaticTokenIssuer {
    token: AuthToken,
}

impl StaticTokenIssuer {
    /// Create a static issuer.
    #[must_use]
    pub const fn new(token: AuthToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenIssuer for StaticTokenIssuer {
    async fn issue(&self) -> Result<AuthToken, CredentialError> {
        Ok(self.token.clone())
    }
}
