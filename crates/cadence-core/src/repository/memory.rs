//! In-process `WorkflowRepository`.
//!
//! All state sits behind one mutex, which makes `commit_step` trivially
//! atomic. Used by tests and by embedders that persist elsewhere.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use cadence_types::error::RepositoryError;
use cadence_types::instance::{
    ActionTask, ActionTaskStatus, InstanceStatus, NodeExecutionRecord, WorkflowInstance,
};
use cadence_types::workflow::WorkflowDefinition;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::workflow::{StepCommit, WorkflowRepository};

#[derive(Debug, Default)]
struct MemoryState {
    drafts: HashMap<Uuid, WorkflowDefinition>,
    versions: BTreeMap<(Uuid, u32), WorkflowDefinition>,
    instances: HashMap<Uuid, WorkflowInstance>,
    history: HashMap<Uuid, Vec<NodeExecutionRecord>>,
    tasks: HashMap<Uuid, ActionTask>,
    action_results: HashMap<String, Value>,
    events: HashSet<(String, String)>,
}

/// Mutex-guarded in-memory repository.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    state: Mutex<MemoryState>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_draft(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.lock().drafts.insert(def.id, def.clone());
        Ok(())
    }

    async fn get_draft(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.lock().drafts.get(id).cloned())
    }

    async fn list_drafts(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut drafts: Vec<_> = self.lock().drafts.values().cloned().collect();
        drafts.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(drafts)
    }

    async fn publish_version(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        let key = (def.id, def.version);
        if state.versions.contains_key(&key) {
            return Err(RepositoryError::Conflict(format!(
                "version {} of {} already published",
                def.version, def.id
            )));
        }
        state.versions.insert(key, def.clone());
        Ok(())
    }

    async fn get_version(
        &self,
        id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.lock().versions.get(&(*id, version)).cloned())
    }

    async fn latest_version(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .lock()
            .versions
            .range((*id, 0)..=(*id, u32::MAX))
            .next_back()
            .map(|(_, def)| def.clone()))
    }

    async fn list_published(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let state = self.lock();
        let mut latest: HashMap<Uuid, &WorkflowDefinition> = HashMap::new();
        for ((id, _), def) in &state.versions {
            // BTreeMap order means later versions overwrite earlier ones.
            latest.insert(*id, def);
        }
        let mut out: Vec<WorkflowDefinition> = latest.into_values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        if state.instances.contains_key(&instance.id) {
            return Err(RepositoryError::Conflict(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        state.instances.insert(instance.id, instance.clone());
        state.history.insert(instance.id, Vec::new());
        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.lock().instances.get(id).cloned())
    }

    async fn commit_step(&self, commit: &StepCommit) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        let id = commit.instance.id;
        let stored = state
            .instances
            .get(&id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.epoch != commit.expected_epoch {
            return Err(RepositoryError::Conflict(format!(
                "instance {id} is at epoch {}, expected {}",
                stored.epoch, commit.expected_epoch
            )));
        }
        if let Some(task) = &commit.enqueue {
            if state.tasks.contains_key(&task.id) {
                return Err(RepositoryError::Conflict(format!(
                    "task {} already exists",
                    task.id
                )));
            }
        }

        let now = commit.instance.updated_at;
        if let Some(finish) = &commit.finish_task {
            if let Some(task) = state.tasks.get_mut(&finish.task_id) {
                task.status = finish.status;
                task.last_error = finish.error.clone().or(task.last_error.take());
                task.updated_at = now;
            }
        }
        if commit.cancel_open_tasks {
            for task in state.tasks.values_mut() {
                if task.instance_id == id && !task.status.is_finished() {
                    task.status = ActionTaskStatus::Cancelled;
                    task.updated_at = now;
                }
            }
        }
        if let Some(task) = &commit.enqueue {
            state.tasks.insert(task.id, task.clone());
        }
        state
            .history
            .entry(id)
            .or_default()
            .extend(commit.records.iter().cloned());
        state.instances.insert(id, commit.instance.clone());
        Ok(())
    }

    async fn list_history(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<NodeExecutionRecord>, RepositoryError> {
        Ok(self
            .lock()
            .history
            .get(instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_instances_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut out: Vec<_> = self
            .lock()
            .instances
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|i| (i.created_at, i.id));
        Ok(out)
    }

    async fn list_instances(
        &self,
        definition_id: Option<&Uuid>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut out: Vec<_> = self
            .lock()
            .instances
            .values()
            .filter(|i| definition_id.is_none_or(|d| i.definition_id == *d))
            .cloned()
            .collect();
        out.sort_by_key(|i| std::cmp::Reverse((i.created_at, i.id)));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn claim_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_until: DateTime<Utc>,
    ) -> Result<Vec<ActionTask>, RepositoryError> {
        let mut state = self.lock();
        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .tasks
            .values()
            .filter(|t| {
                matches!(t.status, ActionTaskStatus::Pending | ActionTaskStatus::InFlight)
                    && t.next_retry_at <= now
            })
            .map(|t| (t.next_retry_at, t.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(task) = state.tasks.get_mut(&id) {
                task.status = ActionTaskStatus::InFlight;
                task.next_retry_at = claim_until;
                task.updated_at = now;
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_task(&self, task: &ActionTask) -> Result<bool, RepositoryError> {
        let mut state = self.lock();
        let slot = state.tasks.get_mut(&task.id).ok_or(RepositoryError::NotFound)?;
        if slot.status == ActionTaskStatus::Cancelled {
            return Ok(false);
        }
        *slot = task.clone();
        Ok(true)
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<ActionTask>, RepositoryError> {
        Ok(self.lock().tasks.get(id).cloned())
    }

    async fn list_tasks(&self, instance_id: &Uuid) -> Result<Vec<ActionTask>, RepositoryError> {
        let mut out: Vec<_> = self
            .lock()
            .tasks
            .values()
            .filter(|t| t.instance_id == *instance_id)
            .cloned()
            .collect();
        out.sort_by_key(|t| (t.created_at, t.id));
        Ok(out)
    }

    async fn get_action_result(&self, token: &str) -> Result<Option<Value>, RepositoryError> {
        Ok(self.lock().action_results.get(token).cloned())
    }

    async fn record_action_result(&self, token: &str, result: &Value) -> Result<(), RepositoryError> {
        self.lock()
            .action_results
            .entry(token.to_string())
            .or_insert_with(|| result.clone());
        Ok(())
    }

    async fn record_event(&self, event_id: &str, scope: &str) -> Result<bool, RepositoryError> {
        Ok(self
            .lock()
            .events
            .insert((event_id.to_string(), scope.to_string())))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
