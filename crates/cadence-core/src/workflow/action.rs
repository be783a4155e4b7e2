//! Action handler capability and registry.
//!
//! Action handlers are external collaborators (email sender, call placer,
//! tagging service). They implement `ActionHandler`; the dispatcher holds
//! them type-erased through the object-safe `ActionHandlerDyn`:
//! 1. `ActionHandler` uses native async fn in traits
//! 2. `ActionHandlerDyn` is blanket-implemented for every `ActionHandler`
//! 3. `ActionRegistry` stores `Arc<dyn ActionHandlerDyn>` keyed by action type

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Handler contract
// ---------------------------------------------------------------------------

/// Handler failure, classified for the retry manager.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionError {
    /// Timeout, rate limit, unavailable dependency. Retried with backoff.
    #[error("transient action failure: {0}")]
    Transient(String),

    /// Validation failure, rejected payload. Never retried.
    #[error("permanent action failure: {0}")]
    Permanent(String),
}

impl ActionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ActionError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ActionError::Transient(m) | ActionError::Permanent(m) => m,
        }
    }
}

/// Successful handler result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// The side effect happened. `result` is stored on the instance.
    Succeeded {
        #[serde(default)]
        result: Value,
    },
    /// The external system accepted the request and will call back with
    /// `action.completed` / `action.failed` for this task.
    Deferred,
}

/// What a handler learns about the dispatch it is serving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionContext {
    pub task_id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
    pub subject_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Constant across retries and redeliveries of the same task. Handlers
    /// pass it to the external system to deduplicate side effects.
    pub idempotency_token: String,
}

/// An external side-effect executor for one action type.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ActionHandler: Send + Sync {
    /// Action type this handler serves (e.g. "send_email").
    fn action_type(&self) -> &str;

    fn execute(
        &self,
        payload: &Value,
        ctx: &ActionContext,
    ) -> impl Future<Output = Result<ActionOutcome, ActionError>> + Send;
}

/// Object-safe version of [`ActionHandler`] with boxed futures.
pub trait ActionHandlerDyn: Send + Sync {
    fn action_type(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        payload: &'a Value,
        ctx: &'a ActionContext,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutcome, ActionError>> + Send + 'a>>;
}

impl<T: ActionHandler> ActionHandlerDyn for T {
    fn action_type(&self) -> &str {
        ActionHandler::action_type(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        payload: &'a Value,
        ctx: &'a ActionContext,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutcome, ActionError>> + Send + 'a>> {
        Box::pin(self.execute(payload, ctx))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Handlers indexed by action type.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandlerDyn>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own action type, replacing any previous one.
    pub fn register<H: ActionHandler + 'static>(&mut self, handler: H) {
        let handler: Arc<dyn ActionHandlerDyn> = Arc::new(handler);
        self.handlers
            .insert(handler.action_type().to_string(), handler);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<H: ActionHandler + 'static>(mut self, handler: H) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn ActionHandlerDyn>> {
        self.handlers.get(action_type).cloned()
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }

    /// Registered action types, sorted.
    pub fn action_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("action_types", &self.action_types())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

/// Records the payload in the log and succeeds. Usable without integrations.
///
/// Registered as `log` by default; [`LogActionHandler::for_type`] stands it
/// in for another action type.
#[derive(Debug, Clone)]
pub struct LogActionHandler {
    action_type: String,
}

impl LogActionHandler {
    pub fn for_type(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
        }
    }
}

impl Default for LogActionHandler {
    fn default() -> Self {
        Self::for_type("log")
    }
}

impl ActionHandler for LogActionHandler {
    fn action_type(&self) -> &str {
        &self.action_type
    }

    async fn execute(
        &self,
        payload: &Value,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome, ActionError> {
        tracing::info!(
            instance_id = %ctx.instance_id,
            node_id = ctx.node_id.as_str(),
            action_type = self.action_type.as_str(),
            token = ctx.idempotency_token.as_str(),
            %payload,
            "log action"
        );
        Ok(ActionOutcome::Succeeded {
            result: Value::Null,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl ActionHandler for Echo {
        fn action_type(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            payload: &Value,
            _ctx: &ActionContext,
        ) -> Result<ActionOutcome, ActionError> {
            Ok(ActionOutcome::Succeeded {
                result: payload.clone(),
            })
        }
    }

    fn ctx() -> ActionContext {
        ActionContext {
            task_id: Uuid::now_v7(),
            instance_id: Uuid::now_v7(),
            node_id: "notify".into(),
            subject_id: "lead-1".into(),
            attempt: 1,
            idempotency_token: "tok".into(),
        }
    }

    #[tokio::test]
    async fn test_registry_dispatches_through_dyn() {
        let registry = ActionRegistry::new().with(Echo).with(LogActionHandler::default());
        assert_eq!(registry.action_types(), vec!["echo", "log"]);
        assert!(registry.contains("echo"));
        assert!(registry.get("sms").is_none());

        let handler = registry.get("echo").unwrap();
        let out = handler
            .execute_boxed(&json!({ "x": 1 }), &ctx())
            .await
            .unwrap();
        assert_eq!(out, ActionOutcome::Succeeded { result: json!({ "x": 1 }) });
    }

    #[test]
    fn test_error_classification() {
        assert!(ActionError::Transient("429".into()).is_transient());
        assert!(!ActionError::Permanent("bad address".into()).is_transient());
        assert_eq!(ActionError::Permanent("bad address".into()).message(), "bad address");
    }

    #[tokio::test]
    async fn test_log_handler_stands_in_for_type() {
        let registry = ActionRegistry::new().with(LogActionHandler::for_type("send_email"));
        assert!(registry.contains("send_email"));
        let out = registry
            .get("send_email")
            .unwrap()
            .execute_boxed(&json!({ "to": "a@b.c" }), &ctx())
            .await
            .unwrap();
        assert_eq!(out, ActionOutcome::Succeeded { result: Value::Null });
    }
}
