//! Workflow repository trait definition.
//!
//! Defines the storage interface for definitions, instances, history,
//! action tasks and the deduplication ledgers. The infrastructure layer
//! (cadence-infra) implements this trait with SQLite persistence; the
//! `memory` module provides an in-process implementation.

use cadence_types::error::RepositoryError;
use cadence_types::instance::{
    ActionTask, ActionTaskStatus, InstanceStatus, NodeExecutionRecord, WorkflowInstance,
};
use cadence_types::workflow::WorkflowDefinition;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Final state written to an action task as part of a step commit.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFinish {
    pub task_id: Uuid,
    pub status: ActionTaskStatus,
    pub error: Option<String>,
}

/// One atomic scheduler step.
///
/// Applied all-or-nothing: the stored instance epoch must equal
/// `expected_epoch`, otherwise the store returns `RepositoryError::Conflict`
/// and writes nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCommit {
    /// New instance state. Its `epoch` is already advanced.
    pub instance: WorkflowInstance,
    pub expected_epoch: u64,
    /// History records to append, in order.
    pub records: Vec<NodeExecutionRecord>,
    /// Action task created by entering an action node.
    pub enqueue: Option<ActionTask>,
    /// Task the step resolved (callback completion or failure).
    pub finish_task: Option<TaskFinish>,
    /// Cancel every unfinished task of the instance.
    pub cancel_open_tasks: bool,
}

impl StepCommit {
    pub fn new(instance: WorkflowInstance, expected_epoch: u64) -> Self {
        Self {
            instance,
            expected_epoch,
            records: Vec::new(),
            enqueue: None,
            finish_task: None,
            cancel_open_tasks: false,
        }
    }
}

/// Repository trait for workflow persistence.
///
/// Covers four entity families:
/// - **Definitions:** one mutable draft per ID plus immutable published versions.
/// - **Instances:** current state, replaced only through `commit_step`.
/// - **History and tasks:** append-only node records and the action task queue.
/// - **Ledgers:** idempotency results by token and seen event IDs.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert the draft for `def.id`.
    fn save_draft(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_draft(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    fn list_drafts(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Store an immutable published version. `Conflict` if `(id, version)`
    /// already exists.
    fn publish_version(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_version(
        &self,
        id: &Uuid,
        version: u32,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Highest published version for `id`.
    fn latest_version(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Latest published version of every definition, ordered by name.
    fn list_published(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Insert a new instance. `Conflict` if the ID exists.
    fn create_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Apply one scheduler step atomically (see [`StepCommit`]).
    fn commit_step(
        &self,
        commit: &StepCommit,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Full history of an instance, ordered by sequence.
    fn list_history(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<NodeExecutionRecord>, RepositoryError>> + Send;

    /// Instances in `status`, oldest first.
    fn list_instances_by_status(
        &self,
        status: InstanceStatus,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Most recent instances, optionally for one definition.
    fn list_instances(
        &self,
        definition_id: Option<&Uuid>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Action tasks
    // -----------------------------------------------------------------------

    /// Claim up to `limit` tasks that are `Pending` or have an expired
    /// `InFlight` claim, with `next_retry_at <= now`, ordered by
    /// `next_retry_at`. Claimed tasks become `InFlight` with
    /// `next_retry_at = claim_until` and are returned in their new state.
    fn claim_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_until: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<ActionTask>, RepositoryError>> + Send;

    /// Replace a task row unless the stored task is already `Cancelled`.
    ///
    /// The status check and the write are one atomic operation. Returns
    /// `false`, writing nothing, when the stored task is cancelled.
    /// `NotFound` if absent.
    fn update_task(
        &self,
        task: &ActionTask,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn get_task(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ActionTask>, RepositoryError>> + Send;

    /// Tasks of an instance, oldest first.
    fn list_tasks(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ActionTask>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Ledgers
    // -----------------------------------------------------------------------

    /// Result stored under an idempotency token.
    fn get_action_result(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<Option<Value>, RepositoryError>> + Send;

    /// Store a result under a token. The first write wins.
    fn record_action_result(
        &self,
        token: &str,
        result: &Value,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Mark `(event_id, scope)` as processed. Returns `false` when it was
    /// already recorded.
    fn record_event(
        &self,
        event_id: &str,
        scope: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
