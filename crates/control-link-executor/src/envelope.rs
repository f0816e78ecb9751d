//! Command envelope and response records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::validation::ValidationError;

/// Inbound command: `{command_id, type, params, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Caller-supplied id, echoed verbatim in the response.
    pub command_id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl CommandEnvelope {
    /// Create an envelope.
    #[must_use]
    pub fn new(
        command_id: impl Into<String>,
        command_type: impl Into<String>,
        params: Value,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            command_type: command_type.into(),
            params,
            timestamp: None,
        }
    }

    /// Structurally validate a raw inbound message.
    ///
    /// Absent or null `params` become `{}`.
    ///
    /// # Errors
    /// Returns error if a required field is missing or has the wrong type.
    pub fn parse(raw: &Value) -> Result<Self, ValidationError> {
        let obj = raw.as_object().ok_or(ValidationError::NotAnObject)?;
        let command_id = required_string(obj, "command_id")?;
        let command_type = required_string(obj, "type")?;

        let params = match obj.get("params") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(params @ Value::Object(_)) => params.clone(),
            Some(_) => return Err(ValidationError::invalid_field("params", "must be an object")),
        };

        let timestamp = match obj.get("timestamp") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => n.as_i64(),
            Some(_) => return Err(ValidationError::invalid_field("timestamp", "must be a number")),
        };

        Ok(Self {
            command_id,
            command_type,
            params,
            timestamp,
        })
    }
}

fn required_string(obj: &Map<String, Value>, field: &str) -> Result<String, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field.to_string())),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(ValidationError::invalid_field(field, "must not be empty"))
        }
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ValidationError::invalid_field(field, "must be a string")),
    }
}

/// Best-effort `command_id` of a message that failed structural validation.
///
/// Numeric and boolean ids are echoed in their JSON text form so the
/// controller can still correlate the rejection.
#[must_use]
pub fn raw_command_id(raw: &Value) -> Option<String> {
    match raw.get("command_id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        id @ (Value::Number(_) | Value::Bool(_)) => Some(id.to_string()),
        _ => None,
    }
}

/// Outbound response: `{command_id, success, result, error, timestamp}`.
///
/// `command_id` is null only when the inbound message did not carry a usable one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command_id: Option<String>,
    pub success: bool,
    pub result: Value,
    pub error: Option<String>,
    pub timestamp: i64,
}

impl CommandResponse {
    /// Successful response.
    #[must_use]
    pub fn success(command_id: impl Into<String>, result: Value, timestamp: i64) -> Self {
        Self {
            command_id: Some(command_id.into()),
            success: true,
            result,
            error: None,
            timestamp,
        }
    }

    /// Failed response.
    #[must_use]
    pub fn failure(command_id: Option<String>, error: impl Into<String>, timestamp: i64) -> Self {
        Self {
            command_id,
            success: false,
            result: Value::Null,
            error: Some(error.into()),
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_normalizes_params() {
        let env = CommandEnvelope::parse(&json!({
            "command_id": "c1",
            "type": "navigate",
            "timestamp": 1_700_000_000_000_i64
        }))
        .unwrap();
        assert_eq!(env.command_id, "c1");
        assert_eq!(env.command_type, "navigate");
        assert_eq!(env.params, json!({}));
        assert_eq!(env.timestamp, Some(1_700_000_000_000));

        let env =
            CommandEnvelope::parse(&json!({ "command_id": "c2", "type": "x", "params": null }))
                .unwrap();
        assert_eq!(env.params, json!({}));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(
            CommandEnvelope::parse(&json!([1, 2])),
            Err(ValidationError::NotAnObject)
        );
        assert_eq!(
            CommandEnvelope::parse(&json!({ "type": "click" })),
            Err(ValidationError::MissingField("command_id".to_string()))
        );
        assert!(CommandEnvelope::parse(&json!({ "command_id": 5, "type": "click" })).is_err());
        assert!(CommandEnvelope::parse(&json!({ "command_id": "c", "type": "" })).is_err());
        assert!(
            CommandEnvelope::parse(&json!({ "command_id": "c", "type": "t", "params": [1] }))
                .is_err()
        );
    }

    #[test]
    fn test_raw_command_id() {
        assert_eq!(raw_command_id(&json!({ "command_id": "c7" })), Some("c7".to_string()));
        assert_eq!(raw_command_id(&json!({ "command_id": "" })), None);
        assert_eq!(raw_command_id(&json!("text")), None);
        assert_eq!(raw_command_id(&json!({ "command_id": 42 })), Some("42".to_string()));
        assert_eq!(raw_command_id(&json!({ "command_id": null })), None);
        assert_eq!(raw_command_id(&json!({ "command_id": ["a"] })), None);
    }

    #[test]
    fn test_failure_response_shape() {
        let response = CommandResponse::failure(None, "bad", 42);
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "command_id": null,
                "success": false,
                "result": null,
                "error": "bad",
                "timestamp": 42
            })
        );
    }
}
