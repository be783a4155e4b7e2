//! Workflow engine facade.
//!
//! `WorkflowEngine` ties the pieces together: definitions are validated and
//! published through it, instances are started, inspected, cancelled and
//! resumed through it, and its background workers drive delays and actions.
//!
//! # Step discipline
//!
//! Every instance mutation goes through [`WorkflowEngine::advance`], which
//! holds the instance lease, plans a step with the [`Scheduler`] and commits
//! it with an epoch compare-and-swap. A lost race (`RepositoryError::Conflict`)
//! re-reads the instance and plans again; it is never surfaced to callers
//! unless `max_conflict_retries` is exceeded.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_types::config::EngineConfig;
use cadence_types::error::RepositoryError;
use cadence_types::event::{EngineEvent, InboundEvent, ResumeSignal};
use cadence_types::instance::{
    ActionTaskStatus, InstanceSnapshot, InstanceStatus, WaitReason, WorkflowInstance,
};
use cadence_types::workflow::{DefinitionRef, DefinitionStatus, WorkflowDefinition};
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::{EventBus, InstanceEvents};
use crate::repository::workflow::WorkflowRepository;

use super::action::ActionRegistry;
use super::clock::{Clock, SystemClock};
use super::dispatcher::{ActionDispatcher, DispatchCompletion, DispatchReport};
use super::error::EngineError;
use super::lease::LeaseManager;
use super::scheduler::{Advance, Scheduler, StepPlan, callback_signal};
use super::subject::{EmptySubjectDirectory, SubjectDirectory, snapshot_or_empty};
use super::timer::{Wake, WakeQueue};
use super::trigger::{
    EventRoute, IngestOutcome, TriggerListener, TriggerRegistration, bind_variables, resume_scope,
    start_scope,
};
use super::validator::{GraphValidator, ValidationReport};

/// Backoff before a delay wake that hit a transient error fires again.
const WAKE_RETRY_SECS: i64 = 1;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// What `advance` did with a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// At least one step committed; the instance is now in `status`.
    Applied { status: InstanceStatus },
    /// The signal did not apply (stale, terminal, mismatched).
    Ignored,
}

/// Counters from `recover`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub triggers_registered: usize,
    pub wakes_restored: usize,
    pub signals_replayed: usize,
    pub instances_resumed: usize,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// The execution engine, generic over its storage backend.
pub struct WorkflowEngine<R: WorkflowRepository> {
    repo: Arc<R>,
    config: EngineConfig,
    scheduler: Scheduler,
    dispatcher: ActionDispatcher,
    triggers: TriggerListener,
    leases: LeaseManager,
    wakes: WakeQueue,
    definitions: DashMap<(Uuid, u32), Arc<WorkflowDefinition>>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    subjects: Arc<dyn SubjectDirectory>,
    dispatch_ready: Notify,
    /// Completions whose resume failed transiently; retried next pass.
    pending_completions: Mutex<Vec<DispatchCompletion>>,
}

impl<R: WorkflowRepository> WorkflowEngine<R> {
    pub fn new(repo: Arc<R>, registry: ActionRegistry, config: EngineConfig) -> Self {
        let event_bus = EventBus::new(config.event_bus_capacity);
        Self {
            scheduler: Scheduler::new(config.retry.clone(), config.max_steps_per_advance),
            dispatcher: ActionDispatcher::new(registry, &config, event_bus.clone()),
            triggers: TriggerListener::new(),
            leases: LeaseManager::new(),
            wakes: WakeQueue::new(),
            definitions: DashMap::new(),
            event_bus,
            clock: Arc::new(SystemClock),
            subjects: Arc::new(EmptySubjectDirectory),
            dispatch_ready: Notify::new(),
            pending_completions: Mutex::new(Vec::new()),
            repo,
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_subjects(mut self, subjects: Arc<dyn SubjectDirectory>) -> Self {
        self.subjects = subjects;
        self
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    pub fn triggers(&self) -> &TriggerListener {
        &self.triggers
    }

    pub fn pending_wakes(&self) -> usize {
        self.wakes.len()
    }

    /// Observer hook: every engine event.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.event_bus.subscribe()
    }

    /// Observer hook: events of one instance.
    pub fn subscribe_instance(&self, instance_id: Uuid) -> InstanceEvents {
        self.event_bus.subscribe_instance(instance_id)
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate a definition against the registered action types.
    pub fn validate_definition(&self, def: &WorkflowDefinition) -> Result<(), ValidationReport> {
        GraphValidator::new(self.config.max_loop_iterations)
            .with_action_types(self.dispatcher.registry().action_types())
            .validate(def)
    }

    /// Store a new draft. Returns its ID.
    pub async fn create_definition(&self, mut def: WorkflowDefinition) -> Result<Uuid, EngineError> {
        if def.id.is_nil() {
            def.id = Uuid::now_v7();
        }
        if self.repo.get_draft(&def.id).await?.is_some() {
            return Err(RepositoryError::Conflict(format!("definition {} already exists", def.id)).into());
        }
        let now = self.clock.now();
        let next = self.next_version(&def.id).await?;
        def.version = next;
        def.status = DefinitionStatus::Draft;
        def.created_at = now;
        def.updated_at = now;
        def.published_at = None;
        self.repo.save_draft(&def).await?;
        tracing::info!(definition_id = %def.id, name = def.name.as_str(), "definition draft created");
        Ok(def.id)
    }

    /// Replace the draft of an existing definition. Published versions are
    /// never touched.
    pub async fn update_definition(
        &self,
        id: Uuid,
        mut def: WorkflowDefinition,
    ) -> Result<(), EngineError> {
        let draft = self
            .repo
            .get_draft(&id)
            .await?
            .ok_or(EngineError::DefinitionNotFound(id))?;
        def.id = id;
        def.version = draft.version;
        def.status = DefinitionStatus::Draft;
        def.created_at = draft.created_at;
        def.updated_at = self.clock.now();
        def.published_at = None;
        self.repo.save_draft(&def).await?;
        tracing::debug!(definition_id = %id, "definition draft updated");
        Ok(())
    }

    /// Validate the draft and publish it as the next immutable version.
    pub async fn publish_definition(&self, id: Uuid) -> Result<u32, EngineError> {
        let mut draft = self
            .repo
            .get_draft(&id)
            .await?
            .ok_or(EngineError::DefinitionNotFound(id))?;
        self.validate_definition(&draft)?;

        let now = self.clock.now();
        let version = self.next_version(&id).await?;
        let mut published = draft.clone();
        published.version = version;
        published.status = DefinitionStatus::Published;
        published.updated_at = now;
        published.published_at = Some(now);
        self.repo.publish_version(&published).await?;

        draft.version = version + 1;
        draft.updated_at = now;
        self.repo.save_draft(&draft).await?;

        self.triggers.register_definition(&published).await;
        self.definitions
            .insert((id, version), Arc::new(published));
        self.event_bus.publish(EngineEvent::DefinitionPublished {
            definition_id: id,
            version,
        });
        tracing::info!(definition_id = %id, version, "definition published");
        Ok(version)
    }

    /// A published version, or the latest published (falling back to the
    /// draft) when `version` is `None`.
    pub async fn get_definition(
        &self,
        id: Uuid,
        version: Option<u32>,
    ) -> Result<WorkflowDefinition, EngineError> {
        if let Some(version) = version {
            return self
                .load_definition(DefinitionRef { id, version })
                .await
                .map(|d| d.as_ref().clone());
        }
        if let Some(latest) = self.repo.latest_version(&id).await? {
            return Ok(latest);
        }
        self.repo
            .get_draft(&id)
            .await?
            .ok_or(EngineError::DefinitionNotFound(id))
    }

    /// Latest published version of every definition.
    pub async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, EngineError> {
        Ok(self.repo.list_published().await?)
    }

    async fn next_version(&self, id: &Uuid) -> Result<u32, EngineError> {
        Ok(self
            .repo
            .latest_version(id)
            .await?
            .map(|d| d.version + 1)
            .unwrap_or(1))
    }

    async fn load_definition(
        &self,
        def_ref: DefinitionRef,
    ) -> Result<Arc<WorkflowDefinition>, EngineError> {
        if let Some(cached) = self.definitions.get(&(def_ref.id, def_ref.version)) {
            return Ok(Arc::clone(cached.value()));
        }
        let def = self
            .repo
            .get_version(&def_ref.id, def_ref.version)
            .await?
            .ok_or(EngineError::VersionNotFound(def_ref))?;
        let def = Arc::new(def);
        self.definitions
            .insert((def_ref.id, def_ref.version), Arc::clone(&def));
        Ok(def)
    }

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Start an instance of a published version and run it until it parks.
    pub async fn start_instance(
        &self,
        def_ref: DefinitionRef,
        subject_id: &str,
        payload: Value,
    ) -> Result<Uuid, EngineError> {
        let def = self.load_definition(def_ref).await?;
        let registration = TriggerRegistration::from_definition(&def)
            .ok_or(EngineError::VersionNotFound(def_ref))?;

        let now = self.clock.now();
        let id = Uuid::now_v7();
        let candidate = InboundEvent {
            id: id.to_string(),
            event_type: registration.event_type.clone(),
            subject_id: Some(subject_id.to_string()),
            instance_id: None,
            payload: payload.clone(),
            occurred_at: now,
        };
        if !self.triggers.accepts(&registration, &candidate)? {
            return Err(EngineError::TriggerMismatch(def_ref));
        }
        let first = def
            .next_edge(&registration.node_id)
            .map(|e| e.target.clone())
            .ok_or(EngineError::VersionNotFound(def_ref))?;

        let instance = WorkflowInstance {
            id,
            definition_id: def_ref.id,
            definition_version: def_ref.version,
            subject_id: subject_id.to_string(),
            current_node: first,
            variables: bind_variables(&registration.bindings, &payload),
            trigger_payload: payload,
            status: InstanceStatus::Pending,
            wait: None,
            loop_counters: Default::default(),
            epoch: 0,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.repo.create_instance(&instance).await?;
        self.event_bus.publish(EngineEvent::InstanceStarted {
            instance_id: id,
            definition_id: def_ref.id,
            version: def_ref.version,
            subject_id: subject_id.to_string(),
        });
        tracing::info!(instance_id = %id, definition = %def_ref, subject_id, "instance started");

        self.advance(id, None).await?;
        Ok(id)
    }

    /// Start an instance of the latest published version.
    pub async fn start_latest(
        &self,
        definition_id: Uuid,
        subject_id: &str,
        payload: Value,
    ) -> Result<Uuid, EngineError> {
        let latest = self
            .repo
            .latest_version(&definition_id)
            .await?
            .ok_or(EngineError::NotPublished(definition_id))?;
        let def_ref = DefinitionRef {
            id: definition_id,
            version: latest.version,
        };
        self.start_instance(def_ref, subject_id, payload).await
    }

    /// Current state plus full ordered history.
    pub async fn get_instance(&self, id: Uuid) -> Result<InstanceSnapshot, EngineError> {
        let instance = self
            .repo
            .get_instance(&id)
            .await?
            .ok_or(EngineError::InstanceNotFound(id))?;
        let history = self.repo.list_history(&id).await?;
        Ok(InstanceSnapshot { instance, history })
    }

    /// Move a non-terminal instance to `Cancelled`. Late completions and
    /// wakes for it are ignored afterwards.
    pub async fn cancel_instance(&self, id: Uuid) -> Result<(), EngineError> {
        let _lease = self.leases.acquire(id).await;
        let mut conflicts = 0;
        loop {
            let current = self
                .repo
                .get_instance(&id)
                .await?
                .ok_or(EngineError::InstanceNotFound(id))?;
            let def = self.load_definition(current.definition_ref()).await?;
            let node_type = def.node(&current.current_node).map(|n| n.node_type);
            let next_sequence = self.next_sequence(&id).await?;
            let Some(plan) =
                self.scheduler
                    .plan_cancel(&current, node_type, next_sequence, self.clock.now())
            else {
                return Err(EngineError::AlreadyTerminal {
                    id,
                    status: current.status,
                });
            };
            match self.repo.commit_step(&plan.commit).await {
                Ok(()) => {
                    tracing::info!(instance_id = %id, epoch = plan.instance().epoch, "instance cancelled");
                    self.after_commit(plan);
                    return Ok(());
                }
                Err(RepositoryError::Conflict(reason)) => {
                    conflicts += 1;
                    if conflicts > self.config.max_conflict_retries {
                        return Err(EngineError::ConflictRetriesExhausted(id));
                    }
                    tracing::warn!(instance_id = %id, reason = reason.as_str(), "cancel conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Deliver an external event to an instance (action callbacks included).
    pub async fn resume_instance(
        &self,
        id: Uuid,
        event: InboundEvent,
    ) -> Result<IngestOutcome, EngineError> {
        if self.repo.get_instance(&id).await?.is_none() {
            return Err(EngineError::InstanceNotFound(id));
        }
        if !self.repo.record_event(&event.id, &resume_scope(&id)).await? {
            tracing::warn!(instance_id = %id, event_id = event.id.as_str(), "duplicate event ignored");
            return Ok(IngestOutcome::Duplicate);
        }
        let signal = callback_signal(&event).unwrap_or(ResumeSignal::External(event));
        match self.advance(id, Some(signal)).await? {
            StepResult::Applied { .. } => Ok(IngestOutcome::Resumed { instance_id: id }),
            StepResult::Ignored => Ok(IngestOutcome::Unmatched),
        }
    }

    /// Route an inbound event: resume its target or start matching definitions.
    pub async fn ingest_event(&self, event: InboundEvent) -> Result<IngestOutcome, EngineError> {
        match self.triggers.route(&event).await {
            EventRoute::Instance(id) => self.resume_instance(id, event).await,
            EventRoute::Callback { task_id, .. } => match self.repo.get_task(&task_id).await? {
                Some(task) => self.resume_instance(task.instance_id, event).await,
                None => {
                    tracing::warn!(%task_id, event_id = event.id.as_str(), "callback for unknown task");
                    Ok(IngestOutcome::Unmatched)
                }
            },
            EventRoute::Start(registrations) => {
                if registrations.is_empty() {
                    tracing::debug!(event_type = event.event_type.as_str(), "no trigger matched");
                    return Ok(IngestOutcome::Unmatched);
                }
                let Some(subject_id) = event.subject_id.clone() else {
                    tracing::warn!(event_id = event.id.as_str(), "event without subject cannot start instances");
                    return Ok(IngestOutcome::Unmatched);
                };

                let mut started = Vec::new();
                let mut duplicates = 0;
                for registration in registrations {
                    let scope = start_scope(&registration.definition.id);
                    if !self.repo.record_event(&event.id, &scope).await? {
                        duplicates += 1;
                        continue;
                    }
                    match self
                        .start_instance(registration.definition, &subject_id, event.payload.clone())
                        .await
                    {
                        Ok(id) => started.push(id),
                        Err(EngineError::TriggerMismatch(def_ref)) => {
                            tracing::debug!(definition = %def_ref, "trigger rejected payload");
                        }
                        Err(e) => return Err(e),
                    }
                }
                if started.is_empty() && duplicates > 0 {
                    tracing::warn!(event_id = event.id.as_str(), "duplicate event ignored");
                    return Ok(IngestOutcome::Duplicate);
                }
                if started.is_empty() {
                    return Ok(IngestOutcome::Unmatched);
                }
                Ok(IngestOutcome::Started {
                    instance_ids: started,
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stepping
    // -----------------------------------------------------------------------

    /// Run steps for one instance under its lease until it parks or ends.
    ///
    /// `signal` is consumed by the first step only.
    pub async fn advance(
        &self,
        id: Uuid,
        signal: Option<ResumeSignal>,
    ) -> Result<StepResult, EngineError> {
        let _lease = self.leases.acquire(id).await;
        let mut signal = signal;
        let mut conflicts = 0;
        let mut applied = None;

        loop {
            let current = self
                .repo
                .get_instance(&id)
                .await?
                .ok_or(EngineError::InstanceNotFound(id))?;
            let def = self.load_definition(current.definition_ref()).await?;
            let subject = self.subject_snapshot(&current.subject_id).await;
            let next_sequence = self.next_sequence(&id).await?;

            let plan = match self.scheduler.plan(
                &def,
                &current,
                signal.as_ref(),
                &subject,
                next_sequence,
                self.clock.now(),
            ) {
                Advance::Planned(plan) => plan,
                Advance::Ignored { reason } => {
                    if let Some(signal) = &signal {
                        tracing::debug!(
                            instance_id = %id,
                            signal = signal.label(),
                            status = %current.status,
                            reason,
                            "signal ignored"
                        );
                        self.event_bus.publish(EngineEvent::SignalIgnored {
                            instance_id: id,
                            signal: signal.label().to_string(),
                            status: current.status,
                        });
                    }
                    return Ok(applied.unwrap_or(StepResult::Ignored));
                }
            };

            match self.repo.commit_step(&plan.commit).await {
                Ok(()) => {
                    let status = plan.instance().status;
                    self.after_commit(plan);
                    applied = Some(StepResult::Applied { status });
                    if status != InstanceStatus::Running {
                        return Ok(StepResult::Applied { status });
                    }
                    signal = None;
                    conflicts = 0;
                }
                Err(RepositoryError::Conflict(reason)) => {
                    conflicts += 1;
                    if conflicts > self.config.max_conflict_retries {
                        return Err(EngineError::ConflictRetriesExhausted(id));
                    }
                    tracing::warn!(
                        instance_id = %id,
                        expected_epoch = current.epoch,
                        reason = reason.as_str(),
                        "commit conflict, re-reading instance"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn after_commit(&self, plan: StepPlan) {
        let instance = &plan.commit.instance;
        match instance.status {
            InstanceStatus::Completed => {
                tracing::info!(instance_id = %instance.id, "instance completed");
            }
            InstanceStatus::Failed => {
                tracing::info!(
                    instance_id = %instance.id,
                    node_id = instance.current_node.as_str(),
                    error = instance.error.as_deref().unwrap_or_default(),
                    "instance failed"
                );
            }
            InstanceStatus::Waiting => {
                tracing::debug!(
                    instance_id = %instance.id,
                    node_id = instance.current_node.as_str(),
                    epoch = instance.epoch,
                    "instance waiting"
                );
            }
            _ => {}
        }
        for wake in plan.wakes {
            self.wakes.schedule(wake);
        }
        if plan.commit.enqueue.is_some() {
            self.dispatch_ready.notify_one();
        }
        for event in plan.events {
            self.event_bus.publish(event);
        }
    }

    async fn next_sequence(&self, id: &Uuid) -> Result<u32, EngineError> {
        let len = self.repo.list_history(id).await?.len();
        Ok(u32::try_from(len).unwrap_or(u32::MAX))
    }

    async fn subject_snapshot(&self, subject_id: &str) -> Value {
        match self.subjects.snapshot(subject_id).await {
            Ok(found) => snapshot_or_empty(found),
            Err(e) => {
                tracing::warn!(subject_id, error = e.as_str(), "subject lookup failed");
                json!({})
            }
        }
    }

    // -----------------------------------------------------------------------
    // Timers, dispatch, recovery
    // -----------------------------------------------------------------------

    /// Resume every instance whose delay is due. Returns how many resumed.
    ///
    /// A wake that fails transiently is re-queued `WAKE_RETRY_SECS` later.
    pub async fn fire_due_timers(&self) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let due = self.wakes.pop_due(now);
        let mut resumed = 0;
        for wake in due {
            let signal = ResumeSignal::DelayElapsed { epoch: wake.epoch };
            match self.advance(wake.instance_id, Some(signal)).await {
                Ok(StepResult::Applied { .. }) => resumed += 1,
                Ok(StepResult::Ignored) => {}
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        instance_id = %wake.instance_id,
                        error = %e,
                        "delay wake failed, retrying"
                    );
                    self.wakes.schedule(Wake {
                        resume_at: now + chrono::Duration::seconds(WAKE_RETRY_SECS),
                        ..wake
                    });
                }
                Err(e) => {
                    tracing::warn!(instance_id = %wake.instance_id, error = %e, "delay wake dropped");
                }
            }
        }
        Ok(resumed)
    }

    /// Run one dispatch pass and resume instances whose tasks finished.
    ///
    /// Completions left over from a previous pass are applied first.
    pub async fn process_due_actions(&self) -> Result<DispatchReport, EngineError> {
        let carried = std::mem::take(&mut *self.lock_pending());
        self.apply_completions(carried).await;

        let (report, completions) = self
            .dispatcher
            .dispatch_due(self.repo.as_ref(), self.clock.as_ref())
            .await?;
        self.apply_completions(completions).await;
        Ok(report)
    }

    /// Completion resumes waiting for a retry.
    pub fn pending_completions(&self) -> usize {
        self.lock_pending().len()
    }

    async fn apply_completions(&self, completions: Vec<DispatchCompletion>) {
        let mut failed = Vec::new();
        for completion in completions {
            let signal = completion.signal.clone();
            match self.advance(completion.instance_id, Some(signal)).await {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        instance_id = %completion.instance_id,
                        task_id = %completion.task_id,
                        error = %e,
                        "action completion could not be applied, retrying"
                    );
                    failed.push(completion);
                }
                Err(e) => {
                    tracing::warn!(
                        instance_id = %completion.instance_id,
                        task_id = %completion.task_id,
                        error = %e,
                        "action completion dropped"
                    );
                }
            }
        }
        if !failed.is_empty() {
            self.lock_pending().extend(failed);
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<DispatchCompletion>> {
        self.pending_completions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Rebuild in-memory state after a restart.
    ///
    /// Registers published triggers, re-queues delay wakes, replays finished
    /// tasks whose completion never reached the instance, and advances
    /// instances left pending or running.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();
        for def in self.repo.list_published().await? {
            if self.triggers.register_definition(&def).await {
                report.triggers_registered += 1;
            }
        }

        for instance in self.repo.list_instances_by_status(InstanceStatus::Waiting).await? {
            let Some(wait) = &instance.wait else { continue };
            match &wait.reason {
                WaitReason::Delay { resume_at } => {
                    self.wakes.schedule(Wake {
                        resume_at: *resume_at,
                        instance_id: instance.id,
                        epoch: instance.epoch,
                    });
                    report.wakes_restored += 1;
                }
                WaitReason::Action { task_id, token } => {
                    let Some(task) = self.repo.get_task(task_id).await? else {
                        continue;
                    };
                    let signal = match task.status {
                        ActionTaskStatus::Succeeded => ResumeSignal::ActionCompleted {
                            task_id: task.id,
                            result: self.repo.get_action_result(token).await?.unwrap_or(Value::Null),
                        },
                        ActionTaskStatus::Failed => ResumeSignal::ActionFailed {
                            task_id: task.id,
                            error: task.last_error.clone().unwrap_or_else(|| "action failed".into()),
                        },
                        _ => continue,
                    };
                    if let StepResult::Applied { .. } = self.advance(instance.id, Some(signal)).await? {
                        report.signals_replayed += 1;
                    }
                }
            }
        }

        for status in [InstanceStatus::Pending, InstanceStatus::Running] {
            for instance in self.repo.list_instances_by_status(status).await? {
                if let StepResult::Applied { .. } = self.advance(instance.id, None).await? {
                    report.instances_resumed += 1;
                }
            }
        }

        tracing::info!(?report, "engine state recovered");
        Ok(report)
    }
}

impl<R: WorkflowRepository + 'static> WorkflowEngine<R> {
    /// Spawn the timer and dispatch loops. Both exit when `cancel` fires.
    pub fn spawn_workers(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let timer = {
            let engine = Arc::clone(self);
            let cancel = cancel.clone();
            let tick = Duration::from_millis(self.config.timer_tick_ms.max(1));
            tokio::spawn(async move {
                tracing::debug!(tick_ms = tick.as_millis() as u64, "timer loop started");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(engine.until_next_wake(tick)) => {}
                        _ = engine.wakes.notified() => {}
                    }
                    if let Err(e) = engine.fire_due_timers().await {
                        tracing::error!(error = %e, "timer pass failed");
                    }
                }
                tracing::debug!("timer loop stopped");
            })
        };

        let dispatch = {
            let engine = Arc::clone(self);
            let poll = Duration::from_millis(self.config.dispatch_poll_ms.max(1));
            tokio::spawn(async move {
                tracing::debug!(poll_ms = poll.as_millis() as u64, "dispatch loop started");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(poll) => {}
                        _ = engine.dispatch_ready.notified() => {}
                    }
                    if let Err(e) = engine.process_due_actions().await {
                        tracing::error!(error = %e, "dispatch pass failed");
                    }
                    engine.leases.release_idle();
                }
                tracing::debug!("dispatch loop stopped");
            })
        };

        vec![timer, dispatch]
    }

    fn until_next_wake(&self, tick: Duration) -> Duration {
        let Some(next) = self.wakes.next_due() else {
            return tick;
        };
        (next - self.clock.now())
            .to_std()
            .map(|d| d.min(tick))
            .unwrap_or(Duration::ZERO)
    }
}

impl<R: WorkflowRepository> std::fmt::Debug for WorkflowEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("dispatcher", &self.dispatcher)
            .field("pending_wakes", &self.wakes.len())
            .field("cached_definitions", &self.definitions.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
