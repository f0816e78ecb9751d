//! In-memory connector.
//!
//! Useful for embedding the agent in-process and for tests: every accepted
//! connection hands its controller-side end to the embedder.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    TransportError,
    connection::{Connection, Connector, Frame},
};

/// Controller side of an in-memory connection.
#[derive(Debug)]
pub struct RemoteEnd {
    /// Address the agent asked for.
    pub url: String,
    /// Frames to the agent.
    pub to_agent: mpsc::UnboundedSender<Frame>,
    /// Frames from the agent.
    pub from_agent: mpsc::UnboundedReceiver<Frame>,
}

impl RemoteEnd {
    /// Send a JSON message to the agent.
    ///
    /// Returns false if the agent side is gone.
    pub fn send_json(&self, message: &Value) -> bool {
        self.to_agent
            .send(Frame::Text(message.to_string()))
            .is_ok()
    }

    /// Close the connection from the controller side.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.to_agent.send(Frame::close(code, reason));
    }

    /// Next frame from the agent.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.from_agent.recv().await
    }

    /// Next text frame from the agent, parsed as JSON.
    ///
    /// Returns `None` once the agent closes the connection.
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            match self.from_agent.recv().await? {
                Frame::Text(text) => {
                    if let Ok(value) = serde_json::from_str(&text) {
                        return Some(value);
                    }
                }
                Frame::Close { .. } => return None,
            }
        }
    }
}

/// Connector producing in-process connections.
#[derive(Debug)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<RemoteEnd>,
    refuse: AtomicBool,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    /// Create a connector and the stream of accepted connections.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted,
                refuse: AtomicBool::new(false),
                attempts: AtomicUsize::new(0),
            },
            rx,
        )
    }

    /// Make subsequent connection attempts fail (or succeed again).
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connection attempts so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!("{url}: connection refused")));
        }

        let (to_agent, inbound) = mpsc::unbounded_channel();
        let (outbound, from_agent) = mpsc::unbounded_channel();

        self.accepted
            .send(RemoteEnd {
                url: url.to_string(),
                to_agent,
                from_agent,
            })
            .map_err(|_| TransportError::Connect(format!("{url}: no listener")))?;

        Ok(Connection { outbound, inbound })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (connector, mut accepted) = MemoryConnector::new();
        let mut conn = connector.connect("mem://controller").await.unwrap();
        let mut remote = accepted.recv().await.unwrap();
        assert_eq!(remote.url, "mem://controller");

        assert!(remote.send_json(&json!({ "type": "ping" })));
        assert_eq!(
            conn.inbound.recv().await,
            Some(Frame::Text(r#"{"type":"ping"}"#.to_string()))
        );

        conn.outbound.send(Frame::Text("{\"a\":1}".to_string())).unwrap();
        assert_eq!(remote.recv_json().await, Some(json!({ "a": 1 })));
    }

    #[tokio::test]
    async fn test_refused_connection_counts_attempt() {
        let (connector, _accepted) = MemoryConnector::new();
        connector.set_refuse(true);
        assert!(connector.connect("mem://x").await.is_err());
        assert_eq!(connector.attempts(), 1);
    }
}
