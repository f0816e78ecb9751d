//! Access policy applied before opening a connection.

use url::Url;

/// Trait for vetting target addresses.
pub trait AccessPolicy: Send + Sync {
    /// Check whether `url` may be connected to.
    ///
    /// # Errors
    /// Returns the veto reason if the address is not allowed.
    fn check(&self, url: &str) -> Result<(), String>;
}

/// Policy allowing every address.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn check(&self, _url: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Host-based allow/block lists.
///
/// The block list wins; a non-empty allow list admits only its hosts.
#[derive(Debug, Default, Clone)]
pub struct HostPolicy {
    allowed: Vec<String>,
    blocked: Vec<String>,
}

impl HostPolicy {
    /// Create an empty policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a host.
    #[must_use]
    pub fn allow(mut self, host: impl Into<String>) -> Self {
        self.allowed.push(host.into().to_ascii_lowercase());
        self
    }

    /// Block a host.
    #[must_use]
    pub fn block(mut self, host: impl Into<String>) -> Self {
        self.blocked.push(host.into().to_ascii_lowercase());
        self
    }
}

impl AccessPolicy for HostPolicy {
    fn check(&self, url: &str) -> Result<(), String> {
        let parsed = Url::parse(url).map_err(|e| format!("invalid address: {e}"))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(format!("unsupported scheme: {}", parsed.scheme()));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| "address has no host".to_string())?
            .to_ascii_lowercase();

        if self.blocked.iter().any(|b| *b == host) {
            return Err(format!("host {host} is blocked"));
        }
        if !self.allowed.is_empty() && !self.allowed.iter().any(|a| *a == host) {
            return Err(format!("host {host} is not allowed"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_list_wins() {
        let policy = HostPolicy::new().allow("localhost").block("LOCALHOST");
        let err = policy.check("ws://localhost:8765/browser").unwrap_err();
        assert!(err.contains("blocked"));
    }

    #[test]
    fn test_allow_list_restricts() {
        let policy = HostPolicy::new().allow("127.0.0.1");
        assert!(policy.check("ws://127.0.0.1:8765").is_ok());
        assert!(policy.check("wss://example.com").is_err());
    }

    #[test]
    fn test_rejects_non_websocket_scheme() {
        assert!(HostPolicy::new().check("http://localhost").is_err());
        assert!(HostPolicy::new().check("not a url").is_err());
        assert!(AllowAll.check("anything").is_ok());
    }
}
