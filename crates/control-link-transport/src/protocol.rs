//! Session-level wire messages.
//!
//! Command envelopes and responses belong to the executor; this module covers
//! what the session itself puts on the wire.

use control_link_core::LinkStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control message exchanged by the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Connection-level status, agent to controller.
    Status {
        status: LinkStatus,
        data: Value,
        timestamp: i64,
    },
    /// Keep-alive, agent to controller, no reply expected.
    Heartbeat { timestamp: i64 },
    /// Auth request, agent to controller.
    Auth {
        token: String,
        timestamp: i64,
        capabilities: Vec<String>,
    },
    /// Auth verdict, controller to agent.
    AuthResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Encryption envelope around any other message.
    Encrypted { payload: String },
}

impl ControlMessage {
    /// Serialize into a JSON value.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Parse an auth verdict; any other message yields `None`.
    #[must_use]
    pub fn auth_response(value: &Value) -> Option<(bool, Option<String>)> {
        if value.get("type").and_then(Value::as_str) != Some("auth_response") {
            return None;
        }
        match serde_json::from_value::<Self>(value.clone()) {
            Ok(Self::AuthResponse { success, error }) => Some((success, error)),
            _ => None,
        }
    }
}

/// Message type of a raw inbound value, if it carries one.
#[must_use]
pub fn message_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_status_serialization() {
        let msg = ControlMessage::Status {
            status: LinkStatus::Blocked,
            data: json!({ "url": "ws://evil" }),
            timestamp: 42,
        };
        let value = msg.to_value().unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["status"], "blocked");
        assert_eq!(value["timestamp"], 42);
    }

    #[test]
    fn test_auth_request_shape() {
        let msg = ControlMessage::Auth {
            token: "tok".to_string(),
            timestamp: 7,
            capabilities: vec!["navigate".to_string()],
        };
        let value = msg.to_value().unwrap();
        assert_eq!(
            value,
            json!({ "type": "auth", "token": "tok", "timestamp": 7, "capabilities": ["navigate"] })
        );
    }

    #[test]
    fn test_auth_response_parsing() {
        let ok = json!({ "type": "auth_response", "success": true });
        assert_eq!(ControlMessage::auth_response(&ok), Some((true, None)));

        let rejected = json!({ "type": "auth_response", "success": false, "error": "bad token" });
        assert_eq!(
            ControlMessage::auth_response(&rejected),
            Some((false, Some("bad token".to_string())))
        );

        let command = json!({ "command_id": "c1", "type": "navigate", "params": {} });
        assert_eq!(ControlMessage::auth_response(&command), None);
        assert_eq!(message_type(&command), Some("navigate"));
    }
}
