//! Link configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment prefix for overrides, e.g. `CONTROL_LINK__REQUIRE_AUTH=true`.
pub const ENV_PREFIX: &str = "CONTROL_LINK";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Recognized options for the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Plain transport address.
    pub url: String,
    /// Secure transport address.
    pub secure_url: String,
    /// Use `secure_url` instead of `url`.
    pub prefer_secure: bool,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// First reconnect delay.
    pub initial_reconnect_delay_ms: u64,
    /// Upper bound on the reconnect delay.
    pub max_reconnect_delay_ms: u64,
    /// Default per-step timeout for queued commands.
    pub command_timeout_ms: u64,
    /// Heartbeat period while connected.
    pub heartbeat_interval_ms: u64,
    /// Run the auth handshake after the connection opens.
    pub require_auth: bool,
    /// Wrap every outbound payload in an encryption envelope.
    pub require_encryption: bool,
    /// Bound on the auth handshake.
    pub auth_timeout_ms: u64,
    /// Capabilities advertised in the auth request.
    pub capabilities: Vec<String>,
    /// Bootstrap auth token.
    pub auth_token: Option<String>,
    /// Bootstrap encryption key material.
    pub encryption_key: Option<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8765/browser".to_string(),
            secure_url: "wss://localhost:8765/browser".to_string(),
            prefer_secure: false,
            max_reconnect_attempts: 10,
            initial_reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            command_timeout_ms: 30_000,
            heartbeat_interval_ms: 30_000,
            require_auth: false,
            require_encryption: false,
            auth_timeout_ms: 10_000,
            capabilities: Vec::new(),
            auth_token: None,
            encryption_key: None,
        }
    }
}

impl LinkConfig {
    /// Address the session connects to.
    #[must_use]
    pub fn transport_url(&self) -> &str {
        if self.prefer_secure {
            &self.secure_url
        } else {
            &self.url
        }
    }

    /// Delay before reconnect attempt number `attempt` (zero-based).
    ///
    /// `min(initial * 2^attempt, max)`, saturating on overflow.
    #[must_use]
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let delay = self
            .initial_reconnect_delay_ms
            .saturating_mul(factor)
            .min(self.max_reconnect_delay_ms);
        Duration::from_millis(delay)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Check option consistency.
    ///
    /// # Errors
    /// Returns error if a period is zero or the delay bounds are inverted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("initial_reconnect_delay_ms", self.initial_reconnect_delay_ms),
            ("max_reconnect_delay_ms", self.max_reconnect_delay_ms),
            ("command_timeout_ms", self.command_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("auth_timeout_ms", self.auth_timeout_ms),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.initial_reconnect_delay_ms > self.max_reconnect_delay_ms {
            return Err(ConfigError::Invalid(
                "initial_reconnect_delay_ms exceeds max_reconnect_delay_ms".to_string(),
            ));
        }
        if self.transport_url().trim().is_empty() {
            return Err(ConfigError::Invalid("transport address is empty".to_string()));
        }
        Ok(())
    }
}

/// Load configuration from an optional TOML file, then `CONTROL_LINK__*`
/// environment overrides (double underscore separates nested keys).
///
/// # Errors
/// Returns error if a source cannot be parsed or the result is invalid.
pub fn load_config(path: Option<&Path>) -> Result<LinkConfig, ConfigError> {
    let mut builder = ::config::Config::builder();

    if let Some(path) = path {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
        }
        builder = builder.add_source(::config::File::from(path.to_path_buf()).required(false));
    }

    builder = builder.add_source(
        ::config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let config: LinkConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    tracing::debug!(
        url = config.transport_url(),
        require_auth = config.require_auth,
        require_encryption = config.require_encryption,
        "Configuration loaded"
    );
    Ok(config)
}
