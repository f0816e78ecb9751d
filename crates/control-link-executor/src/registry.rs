//! Operation registry.

use std::{
    any::Any,
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, PoisonError, RwLock},
};

use control_link_core::{Operation, OperationError};
use futures::FutureExt;
use serde_json::Value;

use crate::validation::ParamValidator;

/// A registered operation and its optional parameter validator.
#[derive(Clone)]
pub struct Registered {
    pub operation: Arc<dyn Operation>,
    pub validator: Option<Arc<dyn ParamValidator>>,
}

/// Maps command types to operations.
#[derive(Default)]
pub struct OperationRegistry {
    entries: RwLock<HashMap<String, Registered>>,
}

impl OperationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation. Replaces any previous registration.
    pub fn register(&self, command_type: impl Into<String>, operation: Arc<dyn Operation>) {
        self.insert(
            command_type.into(),
            Registered {
                operation,
                validator: None,
            },
        );
    }

    /// Register an operation guarded by a parameter validator.
    pub fn register_validated(
        &self,
        command_type: impl Into<String>,
        operation: Arc<dyn Operation>,
        validator: impl ParamValidator + 'static,
    ) {
        self.insert(
            command_type.into(),
            Registered {
                operation,
                validator: Some(Arc::new(validator)),
            },
        );
    }

    fn insert(&self, command_type: String, registered: Registered) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.insert(command_type.clone(), registered).is_some() {
            tracing::debug!(%command_type, "Replaced registered operation");
        }
    }

    /// Look up an operation by command type.
    #[must_use]
    pub fn resolve(&self, command_type: &str) -> Option<Registered> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(command_type)
            .cloned()
    }

    /// Whether a command type is registered.
    #[must_use]
    pub fn contains(&self, command_type: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(command_type)
    }

    /// Registered command types, sorted.
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

/// Run an operation, turning a panic into an operation failure.
pub async fn invoke(operation: Arc<dyn Operation>, params: Value) -> Result<Value, OperationError> {
    match AssertUnwindSafe(operation.execute(params)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(%message, "Operation panicked");
            Err(OperationError::new(format!("operation panicked: {message}")))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
