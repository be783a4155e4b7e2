//! Event types for the Cadence engine.
//!
//! `InboundEvent` is what collaborators deliver (at least once).
//! `ResumeSignal` is what wakes a waiting instance.
//! `EngineEvent` is broadcast on the engine event bus so observers can be
//! notified instead of polling `GetInstance`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::instance::InstanceStatus;

/// Event type used by action-completion callbacks.
pub const ACTION_COMPLETED_EVENT: &str = "action.completed";
/// Event type used by action-failure callbacks.
pub const ACTION_FAILED_EVENT: &str = "action.failed";

/// An external event delivered to the trigger listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundEvent {
    /// Producer-assigned ID. Deduplication key.
    pub id: String,
    pub event_type: String,
    /// Subject the event concerns. Required to start new instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    /// Targets a specific instance instead of matching triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<Uuid>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

/// Wakes a waiting instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResumeSignal {
    ActionCompleted {
        task_id: Uuid,
        #[serde(default)]
        result: Value,
    },
    ActionFailed { task_id: Uuid, error: String },
    /// Delay expiry. `epoch` is the instance epoch at which the wait began.
    DelayElapsed { epoch: u64 },
    External(InboundEvent),
}

impl ResumeSignal {
    pub fn label(&self) -> &'static str {
        match self {
            ResumeSignal::ActionCompleted { .. } => "action_completed",
            ResumeSignal::ActionFailed { .. } => "action_failed",
            ResumeSignal::DelayElapsed { .. } => "delay_elapsed",
            ResumeSignal::External(_) => "external",
        }
    }
}

/// Engine lifecycle notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    DefinitionPublished {
        definition_id: Uuid,
        version: u32,
    },
    InstanceStarted {
        instance_id: Uuid,
        definition_id: Uuid,
        version: u32,
        subject_id: String,
    },
    NodeExecuted {
        instance_id: Uuid,
        node_id: String,
        sequence: u32,
    },
    InstanceWaiting {
        instance_id: Uuid,
        node_id: String,
        reason: String,
    },
    ActionDispatched {
        instance_id: Uuid,
        task_id: Uuid,
        action_type: String,
        attempt: u32,
    },
    ActionRetryScheduled {
        instance_id: Uuid,
        task_id: Uuid,
        attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
    InstanceCompleted {
        instance_id: Uuid,
    },
    InstanceFailed {
        instance_id: Uuid,
        error: String,
    },
    InstanceCancelled {
        instance_id: Uuid,
    },
    /// A resume signal was dropped (stale epoch, terminal instance or
    /// mismatched wait).
    SignalIgnored {
        instance_id: Uuid,
        signal: String,
        status: InstanceStatus,
    },
}

impl EngineEvent {
    /// The instance this event concerns, if any.
    pub fn instance_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::DefinitionPublished { .. } => None,
            EngineEvent::InstanceStarted { instance_id, .. }
            | EngineEvent::NodeExecuted { instance_id, .. }
            | EngineEvent::InstanceWaiting { instance_id, .. }
            | EngineEvent::ActionDispatched { instance_id, .. }
            | EngineEvent::ActionRetryScheduled { instance_id, .. }
            | EngineEvent::InstanceCompleted { instance_id }
            | EngineEvent::InstanceFailed { instance_id, .. }
            | EngineEvent::InstanceCancelled { instance_id }
            | EngineEvent::SignalIgnored { instance_id, .. } => Some(*instance_id),
        }
    }
}
