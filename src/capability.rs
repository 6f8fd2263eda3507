//! Capability seam: actions and callbacks.
//!
//! Nodes declare *what* to invoke ([`ActionSpec`]/[`CallbackSpec`]); the
//! business logic behind those declarations lives outside this crate and
//! plugs in through the traits here. The runtime looks handlers up in a
//! [`CapabilityRegistry`] by the spec's operation name.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::graphs::{ActionSpec, CallbackSpec};

/// Failure reported by an action handler.
///
/// The runtime wraps this into an [`ActionError`] carrying the node
/// context; handlers only describe what went wrong on their side.
#[derive(Debug, Error, Diagnostic)]
#[error("{message}")]
#[diagnostic(code(waterflow::capability::action_failed))]
pub struct ActionFailure {
    pub message: String,
    /// Optional structured detail for diagnostics.
    pub details: Option<Value>,
}

impl ActionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// An action failure annotated with where it happened.
///
/// Errors are node-isolated: the owning token is marked `Error`, sibling
/// branches and the rest of the trace continue unless the node is critical.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionError {
    pub node_id: String,
    pub node_kind: String,
    pub operation: String,
    pub message: String,
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "action '{}' failed at {} node '{}': {}",
            self.operation, self.node_kind, self.node_id, self.message
        )
    }
}

impl std::error::Error for ActionError {}

/// Executes the action declared on a state node.
///
/// Receives the token payload by value and returns the (possibly
/// transformed) payload for the successor tokens.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, spec: &ActionSpec, data: Value) -> Result<Value, ActionFailure>;
}

/// Receives node-completion notifications.
///
/// Failures are logged by the runtime and never propagated; a callback can
/// not fail a token.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    async fn on_complete(&self, spec: &CallbackSpec, data: &Value) -> Result<(), ActionFailure>;
}

/// Built-in pass-through action.
pub struct EchoHandler;

#[async_trait]
impl ActionHandler for EchoHandler {
    async fn execute(&self, _spec: &ActionSpec, data: Value) -> Result<Value, ActionFailure> {
        Ok(data)
    }
}

/// Handler lookup by operation name (actions) and callback name.
///
/// Registered once before the engine starts; shared read-only afterwards.
pub struct CapabilityRegistry {
    actions: FxHashMap<String, Arc<dyn ActionHandler>>,
    callbacks: FxHashMap<String, Arc<dyn CallbackHandler>>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        let mut actions: FxHashMap<String, Arc<dyn ActionHandler>> = FxHashMap::default();
        actions.insert("echo".to_string(), Arc::new(EchoHandler));
        Self {
            actions,
            callbacks: FxHashMap::default(),
        }
    }
}

impl CapabilityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_action(&mut self, operation: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.actions.insert(operation.into(), handler);
    }

    pub fn register_callback(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn CallbackHandler>,
    ) {
        self.callbacks.insert(name.into(), handler);
    }

    #[must_use]
    pub fn action(&self, operation: &str) -> Option<Arc<dyn ActionHandler>> {
        self.actions.get(operation).cloned()
    }

    #[must_use]
    pub fn callback(&self, name: &str) -> Option<Arc<dyn CallbackHandler>> {
        self.callbacks.get(name).cloned()
    }
}
