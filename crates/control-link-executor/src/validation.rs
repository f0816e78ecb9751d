//! Parameter validation.
//!
//! Validators run after structural validation and before any task record is
//! created. They may rewrite parameters in place (sanitization).

use std::{fmt, marker::PhantomData, sync::LazyLock};

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Validation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Command must be a JSON object")]
    NotAnObject,
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("Unknown command type: {0}")]
    UnknownType(String),
    #[error("Invalid parameter {param}: {reason}")]
    InvalidParam { param: String, reason: String },
    #[error("Parameter {param} contains a disallowed pattern")]
    DisallowedPattern { param: String },
}

impl ValidationError {
    pub(crate) fn invalid_field(field: &str, reason: &str) -> Self {
        Self::InvalidField {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Invalid parameter error.
    #[must_use]
    pub fn invalid_param(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParam {
            param: param.into(),
            reason: reason.into(),
        }
    }
}

/// Trait for type-specific parameter validation.
pub trait ParamValidator: Send + Sync {
    /// Validate, and optionally sanitize, parameters.
    ///
    /// # Errors
    /// Returns error if the parameters are not acceptable.
    fn validate(&self, params: &mut Value) -> Result<(), ValidationError>;
}

impl<F> ParamValidator for F
where
    F: Fn(&mut Value) -> Result<(), ValidationError> + Send + Sync,
{
    fn validate(&self, params: &mut Value) -> Result<(), ValidationError> {
        self(params)
    }
}

/// Require a string parameter holding an `http`/`https` URL.
#[derive(Debug, Clone)]
pub struct RequireUrl {
    param: String,
}

impl RequireUrl {
    #[must_use]
    pub fn new(param: impl Into<String>) -> Self {
        Self {
            param: param.into(),
        }
    }
}

impl ParamValidator for RequireUrl {
    fn validate(&self, params: &mut Value) -> Result<(), ValidationError> {
        let raw = params
            .get(&self.param)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ValidationError::invalid_param(&self.param, "a URL string is required")
            })?;
        let url = Url::parse(raw)
            .map_err(|e| ValidationError::invalid_param(&self.param, e.to_string()))?;
        match url.scheme() {
            "http" | "https" => Ok(()),
            other => Err(ValidationError::invalid_param(
                &self.param,
                format!("unsupported scheme: {other}"),
            )),
        }
    }
}

/// Require a non-empty string parameter.
#[derive(Debug, Clone)]
pub struct RequireString {
    param: String,
}

impl RequireString {
    #[must_use]
    pub fn new(param: impl Into<String>) -> Self {
        Self {
            param: param.into(),
        }
    }
}

impl ParamValidator for RequireString {
    fn validate(&self, params: &mut Value) -> Result<(), ValidationError> {
        match params.get(&self.param).and_then(Value::as_str) {
            Some(s) if !s.trim().is_empty() => Ok(()),
            Some(_) => Err(ValidationError::invalid_param(&self.param, "must not be empty")),
            None => Err(ValidationError::invalid_param(&self.param, "is required")),
        }
    }
}

static SCRIPT_INJECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(<\s*script\b|javascript\s*:|\bon[a-z]+\s*=|data\s*:\s*text/html)")
        .expect("injection screen regex must compile")
});

/// Screen string parameters for script-injection patterns.
///
/// Every string value, nested ones included, has NUL and other control
/// characters (except tab and newlines) stripped before screening.
#[derive(Debug, Clone)]
pub struct InputScreen {
    pattern: Regex,
}

impl Default for InputScreen {
    fn default() -> Self {
        Self {
            pattern: SCRIPT_INJECTION.clone(),
        }
    }
}

impl InputScreen {
    /// Screen with the built-in pattern set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Screen with a custom pattern.
    ///
    /// # Errors
    /// Returns error if the pattern does not compile.
    pub fn with_pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    fn screen(&self, path: &str, value: &mut Value) -> Result<(), ValidationError> {
        match value {
            Value::String(s) => {
                if s.chars().any(is_unsafe_control) {
                    s.retain(|c| !is_unsafe_control(c));
                }
                if self.pattern.is_match(s) {
                    return Err(ValidationError::DisallowedPattern {
                        param: path.to_string(),
                    });
                }
                Ok(())
            }
            Value::Array(items) => items
                .iter_mut()
                .enumerate()
                .try_for_each(|(i, item)| self.screen(&format!("{path}[{i}]"), item)),
            Value::Object(map) => map.iter_mut().try_for_each(|(key, item)| {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                self.screen(&child, item)
            }),
            _ => Ok(()),
        }
    }
}

fn is_unsafe_control(c: char) -> bool {
    c.is_control() && !matches!(c, '\t' | '\n' | '\r')
}

impl ParamValidator for InputScreen {
    fn validate(&self, params: &mut Value) -> Result<(), ValidationError> {
        self.screen("", params)
    }
}

/// Require parameters to deserialize as `T`.
pub struct RequireShape<T> {
    _shape: PhantomData<fn() -> T>,
}

impl<T> RequireShape<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _shape: PhantomData,
        }
    }
}

impl<T> Default for RequireShape<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for RequireShape<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequireShape")
    }
}

impl<T: DeserializeOwned> ParamValidator for RequireShape<T> {
    fn validate(&self, params: &mut Value) -> Result<(), ValidationError> {
        T::deserialize(&*params)
            .map(drop)
            .map_err(|e| ValidationError::invalid_param("params", e.to_string()))
    }
}

/// Run validators in order, stopping at the first failure.
#[derive(Default)]
pub struct AllOf {
    validators: Vec<Box<dyn ParamValidator>>,
}

impl AllOf {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a validator.
    #[must_use]
    pub fn with(mut self, validator: impl ParamValidator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }
}

impl ParamValidator for AllOf {
    fn validate(&self, params: &mut Value) -> Result<(), ValidationError> {
        self.validators.iter().try_for_each(|v| v.validate(params))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_require_url() {
        let v = RequireUrl::new("url");
        assert!(v.validate(&mut json!({ "url": "https://example.com/a" })).is_ok());
        assert!(v.validate(&mut json!({ "url": "ftp://example.com" })).is_err());
        assert!(v.validate(&mut json!({ "url": "not a url" })).is_err());
        assert_eq!(
            v.validate(&mut json!({})),
            Err(ValidationError::invalid_param("url", "a URL string is required"))
        );
    }

    #[test]
    fn test_require_string() {
        let v = RequireString::new("selector");
        assert!(v.validate(&mut json!({ "selector": "#go" })).is_ok());
        assert!(v.validate(&mut json!({ "selector": "  " })).is_err());
        assert!(v.validate(&mut json!({ "selector": 3 })).is_err());
    }

    #[test]
    fn test_input_screen_rejects_injection() {
        let screen = InputScreen::new();
        let err = screen
            .validate(&mut json!({ "fields": [{ "value": "<SCRIPT>alert(1)</script>" }] }))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::DisallowedPattern {
                param: "fields[0].value".to_string()
            }
        );
        assert!(screen.validate(&mut json!({ "href": "javascript:void(0)" })).is_err());
        assert!(screen.validate(&mut json!({ "html": "<img onerror=x>" })).is_err());
    }

    #[test]
    fn test_input_screen_strips_control_chars() {
        let mut params = json!({ "text": "hello\u{0}world\u{7}\n", "count": 3 });
        InputScreen::new().validate(&mut params).unwrap();
        assert_eq!(params, json!({ "text": "helloworld\n", "count": 3 }));

        let mut nested = json!({ "rows": ["a\tb\r\n", { "cell": "x\u{1b}y" }] });
        InputScreen::new().validate(&mut nested).unwrap();
        assert_eq!(nested, json!({ "rows": ["a\tb\r\n", { "cell": "xy" }] }));
    }

    #[test]
    fn test_all_of_stops_at_first_failure() {
        let v = AllOf::new()
            .with(RequireString::new("selector"))
            .with(|_: &mut Value| -> Result<(), ValidationError> {
                Err(ValidationError::invalid_param("x", "unreachable"))
            });
        let err = v.validate(&mut json!({})).unwrap_err();
        assert_eq!(err, ValidationError::invalid_param("selector", "is required"));
    }

    #[test]
    fn test_require_shape() {
        #[derive(Deserialize)]
        struct Target {
            #[allow(dead_code)]
            queue_id: String,
        }
        let v = RequireShape::<Target>::new();
        assert!(v.validate(&mut json!({ "queue_id": "q" })).is_ok());
        assert!(v.validate(&mut json!({ "queue_id": 1 })).is_err());
    }
}
