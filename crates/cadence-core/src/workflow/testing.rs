//! Shared fixtures for workflow tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use cadence_types::error::RepositoryError;
use cadence_types::instance::{ActionTask, InstanceStatus, NodeExecutionRecord, WorkflowInstance};
use cadence_types::workflow::{
    Comparator, DefinitionStatus, Edge, EdgeRoute, Node, NodeConfig, Predicate,
    WorkflowDefinition,
};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::repository::memory::InMemoryWorkflowRepository;
use crate::repository::workflow::{StepCommit, WorkflowRepository};

pub fn node(id: &str, config: NodeConfig) -> Node {
    Node {
        id: id.to_string(),
        name: None,
        node_type: config.node_type(),
        config,
    }
}

pub fn edge(id: &str, source: &str, target: &str) -> Edge {
    Edge {
        id: id.to_string(),
        source: source.to_string(),
        target: target.to_string(),
        route: EdgeRoute::Next,
    }
}

pub fn branch(id: &str, source: &str, target: &str, key: &str, predicate: Predicate) -> Edge {
    Edge {
        id: id.to_string(),
        source: source.to_string(),
        target: target.to_string(),
        route: EdgeRoute::Branch {
            key: key.to_string(),
            predicate,
        },
    }
}

pub fn default_edge(id: &str, source: &str, target: &str, key: &str) -> Edge {
    Edge {
        id: id.to_string(),
        source: source.to_string(),
        target: target.to_string(),
        route: EdgeRoute::Default {
            key: key.to_string(),
        },
    }
}

pub fn action(action_type: &str) -> NodeConfig {
    NodeConfig::Action {
        action_type: action_type.to_string(),
        payload: json!({ "lead": "{{ trigger.lead_id }}", "score": "{{ vars.score }}" }),
        max_attempts: None,
    }
}

/// Trigger(lead_created) -> Condition(score >= 80 ? hot : else)
///   hot:  Action(send_priority_email) -> Terminal
///   else: Delay(2 days) -> Action(send_followup_email) -> Terminal
pub fn lead_scoring_definition() -> WorkflowDefinition {
    let now = Utc::now();
    WorkflowDefinition {
        id: Uuid::now_v7(),
        name: "lead-scoring".to_string(),
        description: None,
        version: 1,
        status: DefinitionStatus::Draft,
        nodes: vec![
            node(
                "start",
                NodeConfig::Trigger {
                    event_type: "lead_created".into(),
                    when: None,
                    bindings: BTreeMap::new(),
                },
            ),
            node("score", NodeConfig::Condition {}),
            node("hot", action("send_priority_email")),
            node("done-hot", NodeConfig::Terminal {}),
            node(
                "wait",
                NodeConfig::Delay {
                    after_secs: Some(2 * 24 * 3600),
                    until: None,
                },
            ),
            node("followup", action("send_followup_email")),
            node("done-else", NodeConfig::Terminal {}),
        ],
        edges: vec![
            edge("e-start", "start", "score"),
            branch(
                "e-hot",
                "score",
                "hot",
                "hot",
                Predicate::Compare {
                    field: "vars.score".into(),
                    cmp: Comparator::Gte,
                    value: json!(80),
                },
            ),
            default_edge("e-else", "score", "wait", "else"),
            edge("e-hot-done", "hot", "done-hot"),
            edge("e-wait", "wait", "followup"),
            edge("e-followup", "followup", "done-else"),
        ],
        created_at: now,
        updated_at: now,
        published_at: None,
    }
}

/// In-memory repository whose next `commit_step` calls fail with a query
/// error, as a locked or briefly unreachable database would.
#[derive(Debug, Default)]
pub struct FlakyRepository {
    inner: InMemoryWorkflowRepository,
    commit_failures: AtomicUsize,
}

impl FlakyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` commits.
    pub fn fail_commits(&self, n: usize) {
        self.commit_failures.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.commit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl WorkflowRepository for FlakyRepository {
    async fn save_draft(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.inner.save_draft(def).await
    }

    async fn get_draft(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        self.inner.get_draft(id).await
    }

    async fn list_drafts(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        self.inner.list_drafts().await
    }

    async fn publish_version(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.inner.publish_version(def).await
    }

    async fn get_version(
        &self,
        id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        self.inner.get_version(id, version).await
    }

    async fn latest_version(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        self.inner.latest_version(id).await
    }

    async fn list_published(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        self.inner.list_published().await
    }

    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        self.inner.create_instance(instance).await
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        self.inner.get_instance(id).await
    }

    async fn commit_step(&self, commit: &StepCommit) -> Result<(), RepositoryError> {
        if self.take_failure() {
            return Err(RepositoryError::Query("database is locked".into()));
        }
        self.inner.commit_step(commit).await
    }

    async fn list_history(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<NodeExecutionRecord>, RepositoryError> {
        self.inner.list_history(instance_id).await
    }

    async fn list_instances_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        self.inner.list_instances_by_status(status).await
    }

    async fn list_instances(
        &self,
        definition_id: Option<&Uuid>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        self.inner.list_instances(definition_id, limit).await
    }

    async fn claim_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_until: DateTime<Utc>,
    ) -> Result<Vec<ActionTask>, RepositoryError> {
        self.inner.claim_due_tasks(now, limit, claim_until).await
    }

    async fn update_task(&self, task: &ActionTask) -> Result<bool, RepositoryError> {
        self.inner.update_task(task).await
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<ActionTask>, RepositoryError> {
        self.inner.get_task(id).await
    }

    async fn list_tasks(&self, instance_id: &Uuid) -> Result<Vec<ActionTask>, RepositoryError> {
        self.inner.list_tasks(instance_id).await
    }

    async fn get_action_result(&self, token: &str) -> Result<Option<Value>, RepositoryError> {
        self.inner.get_action_result(token).await
    }

    async fn record_action_result(&self, token: &str, result: &Value) -> Result<(), RepositoryError> {
        self.inner.record_action_result(token, result).await
    }

    async fn record_event(&self, event_id: &str, scope: &str) -> Result<bool, RepositoryError> {
        self.inner.record_event(event_id, scope).await
    }
}
