//! Trigger listener: routes inbound events to new or waiting instances.
//!
//! `TriggerListener` keeps a registry of the trigger node of every published
//! definition (latest version only). An inbound event is classified into an
//! [`EventRoute`]:
//! - events carrying `instance_id` resume that instance,
//! - `action.completed` / `action.failed` callbacks resume the owner of
//!   `payload.task_id`,
//! - everything else is matched against registered triggers by event type
//!   and optional JEXL `when` clause.
//!
//! Deduplication happens in the engine through the repository event ledger,
//! scoped to the instance (resume) or the definition (start).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use cadence_types::event::{ACTION_COMPLETED_EVENT, ACTION_FAILED_EVENT, InboundEvent};
use cadence_types::workflow::{DefinitionRef, NodeConfig, WorkflowDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::context::lookup;
use super::expression::{ExpressionError, TriggerEvaluator};

// ---------------------------------------------------------------------------
// Registrations
// ---------------------------------------------------------------------------

/// The trigger node of one published definition version.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerRegistration {
    pub definition: DefinitionRef,
    /// Definition name (for logging).
    pub definition_name: String,
    pub node_id: String,
    pub event_type: String,
    pub when: Option<String>,
    pub bindings: BTreeMap<String, String>,
}

impl TriggerRegistration {
    /// Registration for the trigger node of `def`, if it has exactly one.
    pub fn from_definition(def: &WorkflowDefinition) -> Option<Self> {
        let mut triggers = def.trigger_nodes();
        let node = triggers.next()?;
        if triggers.next().is_some() {
            return None;
        }
        let NodeConfig::Trigger {
            event_type,
            when,
            bindings,
        } = &node.config
        else {
            return None;
        };
        Some(Self {
            definition: DefinitionRef {
                id: def.id,
                version: def.version,
            },
            definition_name: def.name.clone(),
            node_id: node.id.clone(),
            event_type: event_type.clone(),
            when: when.clone(),
            bindings: bindings.clone(),
        })
    }
}

/// Where an inbound event should go.
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Resume the named instance with the event.
    Instance(Uuid),
    /// Action callback for a task; the owning instance is looked up by task.
    Callback { task_id: Uuid, failed: bool },
    /// Start one instance per matching registration.
    Start(Vec<TriggerRegistration>),
}

/// Result of ingesting one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Started { instance_ids: Vec<Uuid> },
    Resumed { instance_id: Uuid },
    /// Event ID already processed for the target.
    Duplicate,
    /// Nothing matched, or the targeted instance ignored the event.
    Unmatched,
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Registry of published triggers plus the `when` clause evaluator.
pub struct TriggerListener {
    registrations: Arc<RwLock<HashMap<Uuid, TriggerRegistration>>>,
    evaluator: TriggerEvaluator,
}

impl TriggerListener {
    pub fn new() -> Self {
        Self {
            registrations: Arc::new(RwLock::new(HashMap::new())),
            evaluator: TriggerEvaluator::new(),
        }
    }

    pub fn evaluator(&self) -> &TriggerEvaluator {
        &self.evaluator
    }

    /// Register (or replace) the trigger of a published definition.
    ///
    /// An older version never replaces a newer one.
    pub async fn register_definition(&self, def: &WorkflowDefinition) -> bool {
        let Some(registration) = TriggerRegistration::from_definition(def) else {
            tracing::warn!(definition_id = %def.id, "definition has no single trigger node");
            return false;
        };
        let mut regs = self.registrations.write().await;
        if let Some(existing) = regs.get(&def.id) {
            if existing.definition.version > registration.definition.version {
                return false;
            }
        }
        tracing::debug!(
            definition = %registration.definition,
            event_type = registration.event_type.as_str(),
            "trigger registered"
        );
        regs.insert(def.id, registration);
        true
    }

    pub async fn registration(&self, definition_id: &Uuid) -> Option<TriggerRegistration> {
        self.registrations.read().await.get(definition_id).cloned()
    }

    /// Classify an event.
    pub async fn route(&self, event: &InboundEvent) -> EventRoute {
        if let Some(instance_id) = event.instance_id {
            return EventRoute::Instance(instance_id);
        }
        if event.event_type == ACTION_COMPLETED_EVENT || event.event_type == ACTION_FAILED_EVENT {
            if let Some(task_id) = callback_task_id(event) {
                return EventRoute::Callback {
                    task_id,
                    failed: event.event_type == ACTION_FAILED_EVENT,
                };
            }
        }
        EventRoute::Start(self.matching(event).await)
    }

    /// Registrations whose event type and `when` clause match `event`.
    ///
    /// A `when` clause that fails to evaluate is treated as a non-match.
    pub async fn matching(&self, event: &InboundEvent) -> Vec<TriggerRegistration> {
        let regs = self.registrations.read().await;
        let mut matched: Vec<TriggerRegistration> = regs
            .values()
            .filter(|r| r.event_type == event.event_type)
            .filter(|r| match self.evaluator.matches(r.when.as_deref(), event) {
                Ok(hit) => hit,
                Err(e) => {
                    tracing::warn!(
                        definition = %r.definition,
                        error = %e,
                        "when clause failed to evaluate"
                    );
                    false
                }
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.definition_name.cmp(&b.definition_name));
        matched
    }

    /// Evaluate a trigger's `when` clause directly.
    pub fn accepts(
        &self,
        registration: &TriggerRegistration,
        event: &InboundEvent,
    ) -> Result<bool, ExpressionError> {
        self.evaluator.matches(registration.when.as_deref(), event)
    }
}

impl Default for TriggerListener {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TriggerListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerListener").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initial instance variables from a trigger payload.
///
/// Empty `bindings` copy every top-level field of an object payload. Otherwise
/// each variable takes the value at its payload path; absent paths are left
/// unbound so conditions on them report an unresolved field.
pub fn bind_variables(bindings: &BTreeMap<String, String>, payload: &Value) -> BTreeMap<String, Value> {
    if bindings.is_empty() {
        return match payload {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => BTreeMap::new(),
        };
    }
    bindings
        .iter()
        .filter_map(|(var, path)| lookup(payload, path).map(|v| (var.clone(), v.clone())))
        .collect()
}

/// `payload.task_id` of an action callback event.
pub fn callback_task_id(event: &InboundEvent) -> Option<Uuid> {
    event
        .payload
        .get("task_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// Ledger scope for starting instances of a definition.
pub fn start_scope(definition_id: &Uuid) -> String {
    format!("definition:{definition_id}")
}

/// Ledger scope for resuming an instance.
pub fn resume_scope(instance_id: &Uuid) -> String {
    format!("instance:{instance_id}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::lead_scoring_definition;
    use chrono::Utc;
    use serde_json::json;

    fn event(event_type: &str, payload: Value) -> InboundEvent {
        InboundEvent {
            id: Uuid::now_v7().to_string(),
            event_type: event_type.to_string(),
            subject_id: Some("lead-1".into()),
            instance_id: None,
            payload,
            occurred_at: Utc::now(),
        }
    }

    fn with_when(when: &str) -> WorkflowDefinition {
        let mut def = lead_scoring_definition();
        if let NodeConfig::Trigger { when: w, .. } = &mut def.nodes[0].config {
            *w = Some(when.to_string());
        }
        def
    }

    #[tokio::test]
    async fn test_register_and_match_by_event_type() {
        let listener = TriggerListener::new();
        let def = lead_scoring_definition();
        assert!(listener.register_definition(&def).await);

        let route = listener.route(&event("lead_created", json!({}))).await;
        let EventRoute::Start(hits) = route else {
            panic!("expected start route");
        };
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].definition.id, def.id);

        let EventRoute::Start(none) = listener.route(&event("lead_deleted", json!({}))).await else {
            panic!("expected start route");
        };
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_when_clause_filters() {
        let listener = TriggerListener::new();
        listener
            .register_definition(&with_when("event.source == 'web'"))
            .await;

        assert_eq!(
            listener
                .matching(&event("lead_created", json!({ "source": "web" })))
                .await
                .len(),
            1
        );
        assert!(
            listener
                .matching(&event("lead_created", json!({ "source": "import" })))
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_older_version_does_not_replace_newer() {
        let listener = TriggerListener::new();
        let mut def = lead_scoring_definition();
        def.version = 3;
        listener.register_definition(&def).await;
        def.version = 2;
        assert!(!listener.register_definition(&def).await);
        assert_eq!(
            listener.registration(&def.id).await.unwrap().definition.version,
            3
        );
    }

    #[tokio::test]
    async fn test_route_targets_instance_and_callbacks() {
        let listener = TriggerListener::new();
        let instance_id = Uuid::now_v7();
        let mut targeted = event("anything", json!({}));
        targeted.instance_id = Some(instance_id);
        assert_eq!(listener.route(&targeted).await, EventRoute::Instance(instance_id));

        let task_id = Uuid::now_v7();
        let failed = event(ACTION_FAILED_EVENT, json!({ "task_id": task_id.to_string() }));
        assert_eq!(
            listener.route(&failed).await,
            EventRoute::Callback {
                task_id,
                failed: true
            }
        );
    }

    #[test]
    fn test_bind_variables_copies_payload_when_unbound() {
        let vars = bind_variables(&BTreeMap::new(), &json!({ "score": 90, "name": "Ana" }));
        assert_eq!(vars.len(), 2);
        assert_eq!(vars["score"], json!(90));
    }

    #[test]
    fn test_bind_variables_by_path_skips_missing() {
        let mut bindings = BTreeMap::new();
        bindings.insert("score".to_string(), "lead.score".to_string());
        bindings.insert("owner".to_string(), "lead.owner".to_string());
        let vars = bind_variables(&bindings, &json!({ "lead": { "score": 40 } }));
        assert_eq!(vars.get("score"), Some(&json!(40)));
        assert!(!vars.contains_key("owner"));
    }

    #[test]
    fn test_scopes_are_distinct() {
        let id = Uuid::now_v7();
        assert_ne!(start_scope(&id), resume_scope(&id));
    }
}
