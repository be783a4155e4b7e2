//! Instance, history and action task types.
//!
//! A `WorkflowInstance` is one execution of a published definition for a
//! single subject. It is mutated only by the scheduler under a per-instance
//! lease; every committed step bumps its `epoch`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::{DefinitionRef, NodeType};

// ---------------------------------------------------------------------------
// Workflow Instance
// ---------------------------------------------------------------------------

/// Durable state of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub definition_version: u32,
    /// External subject this instance runs for (e.g. a lead ID).
    pub subject_id: String,
    /// Node the instance is at. Always exists in the bound definition version.
    pub current_node: String,
    /// Variable bindings, seeded from the trigger payload.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// The payload of the event that started this instance.
    #[serde(default)]
    pub trigger_payload: Value,
    pub status: InstanceStatus,
    /// Set while `status == Waiting`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitState>,
    /// Completed iterations per loop node ID.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub loop_counters: BTreeMap<String, u32>,
    /// Incremented on every committed step and on cancel. Stale signals
    /// carry an older epoch and are ignored.
    pub epoch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn definition_ref(&self) -> DefinitionRef {
        DefinitionRef {
            id: self.definition_id,
            version: self.definition_version,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Instance lifecycle status.
///
/// `Pending -> Running -> {Waiting, Completed, Failed, Cancelled}`,
/// `Waiting -> Running` on resume, any non-terminal status `-> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Waiting => "waiting",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown instance status '{other}'")),
        }
    }
}

/// What a waiting instance is parked on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaitState {
    pub reason: WaitReason,
    /// When the instance entered the waiting node.
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitReason {
    Delay { resume_at: DateTime<Utc> },
    Action { task_id: Uuid, token: String },
}

impl WaitReason {
    pub fn label(&self) -> &'static str {
        match self {
            WaitReason::Delay { .. } => "delay",
            WaitReason::Action { .. } => "action_pending",
        }
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Append-only record written when an instance leaves a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeExecutionRecord {
    /// 0-based position in the instance history.
    pub sequence: u32,
    pub node_id: String,
    pub node_type: NodeType,
    pub entered_at: DateTime<Utc>,
    pub exited_at: DateTime<Utc>,
    pub outcome: NodeOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How a node was exited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeOutcome {
    Advanced { edge_id: String },
    Branched { key: String, edge_id: String },
    ActionSucceeded { edge_id: String },
    /// Permanent action failure routed down the node's error edge.
    ActionFailed { edge_id: String },
    DelayElapsed { edge_id: String },
    /// Evaluation error routed down the node's error edge.
    Errored { edge_id: String },
    LoopRepeated { iteration: u32, edge_id: String },
    LoopExited { iterations: u32, edge_id: String },
    Completed,
    Failed,
    Cancelled,
}

impl NodeOutcome {
    /// Edge taken out of the node, for non-terminal outcomes.
    pub fn edge_id(&self) -> Option<&str> {
        match self {
            NodeOutcome::Advanced { edge_id }
            | NodeOutcome::Branched { edge_id, .. }
            | NodeOutcome::ActionSucceeded { edge_id }
            | NodeOutcome::ActionFailed { edge_id }
            | NodeOutcome::DelayElapsed { edge_id }
            | NodeOutcome::Errored { edge_id }
            | NodeOutcome::LoopRepeated { edge_id, .. }
            | NodeOutcome::LoopExited { edge_id, .. } => Some(edge_id),
            NodeOutcome::Completed | NodeOutcome::Failed | NodeOutcome::Cancelled => None,
        }
    }
}

/// What `GetInstance` returns: current state plus full ordered history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceSnapshot {
    pub instance: WorkflowInstance,
    pub history: Vec<NodeExecutionRecord>,
}

// ---------------------------------------------------------------------------
// Action Tasks
// ---------------------------------------------------------------------------

/// A queued side effect for an action node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionTask {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
    pub action_type: String,
    /// Resolved payload (templates already substituted).
    pub payload: Value,
    /// Attempts made so far.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Earliest time the task may be (re)dispatched. While `InFlight` this is
    /// the claim expiry after which the task is redelivered.
    pub next_retry_at: DateTime<Utc>,
    pub status: ActionTaskStatus,
    /// Deterministic per (instance, node, entry epoch). Constant across retries.
    pub idempotency_token: String,
    /// Instance epoch at which the action node was entered.
    pub epoch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTaskStatus {
    Pending,
    InFlight,
    AwaitingCallback,
    Succeeded,
    Failed,
    Cancelled,
}

impl ActionTaskStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            ActionTaskStatus::Succeeded | ActionTaskStatus::Failed | ActionTaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionTaskStatus::Pending => "pending",
            ActionTaskStatus::InFlight => "in_flight",
            ActionTaskStatus::AwaitingCallback => "awaiting_callback",
            ActionTaskStatus::Succeeded => "succeeded",
            ActionTaskStatus::Failed => "failed",
            ActionTaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ActionTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionTaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "awaiting_callback" => Ok(Self::AwaitingCallback),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown action task status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Failed.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
        assert!(!InstanceStatus::Waiting.is_terminal());
        assert!(!InstanceStatus::Pending.is_terminal());
    }

    #[test]
    fn test_status_string_roundtrip() {
        for s in ["pending", "running", "waiting", "completed", "failed", "cancelled"] {
            let status: InstanceStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
        assert!("paused".parse::<InstanceStatus>().is_err());
        let task: ActionTaskStatus = "awaiting_callback".parse().unwrap();
        assert_eq!(task, ActionTaskStatus::AwaitingCallback);
    }

    #[test]
    fn test_outcome_edge_id() {
        let o = NodeOutcome::Branched {
            key: "hot".into(),
            edge_id: "e2".into(),
        };
        assert_eq!(o.edge_id(), Some("e2"));
        assert_eq!(NodeOutcome::Completed.edge_id(), None);
    }

    #[test]
    fn test_wait_reason_serde_tag() {
        let r = WaitReason::Action {
            task_id: Uuid::nil(),
            token: "abc".into(),
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["kind"], "action");
        assert_eq!(r.label(), "action_pending");
    }
}
