//! Action dispatcher and retry manager.
//!
//! Claims due `ActionTask`s from the repository, runs their handlers
//! concurrently (bounded by a semaphore, each under a timeout) and applies
//! the retry policy to the outcome. Successful results are stored in the
//! idempotency ledger under the task's token before anything else happens,
//! so a redelivered task short-circuits without calling the handler again.
//!
//! The dispatcher never touches instance state. It returns
//! [`DispatchCompletion`]s which the engine turns into resume steps.

use std::sync::Arc;
use std::time::Duration;

use cadence_types::config::{EngineConfig, RetryPolicy};
use cadence_types::error::RepositoryError;
use cadence_types::event::{EngineEvent, ResumeSignal};
use cadence_types::instance::{ActionTask, ActionTaskStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowRepository;

use super::action::{ActionContext, ActionError, ActionOutcome, ActionRegistry};
use super::clock::Clock;
use super::retry::RetryHandler;

/// A finished task whose owning instance should be resumed.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchCompletion {
    pub instance_id: Uuid,
    pub task_id: Uuid,
    pub signal: ResumeSignal,
}

/// Counters for one dispatch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub claimed: usize,
    /// Handler invocations actually made.
    pub invoked: usize,
    /// Tasks satisfied from the idempotency ledger.
    pub replayed: usize,
    pub succeeded: usize,
    pub deferred: usize,
    pub retried: usize,
    pub failed: usize,
    /// Tasks dropped because their instance is gone or finished.
    pub skipped: usize,
}

/// Slack a claim keeps beyond the handler timeout.
const CLAIM_MARGIN_SECS: u64 = 30;

/// Claim window, never shorter than the handler timeout plus margin.
fn claim_window(config: &EngineConfig) -> chrono::Duration {
    let floor = config.action_timeout_secs.max(1).saturating_add(CLAIM_MARGIN_SECS);
    let secs = config.claim_timeout_secs.max(floor);
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or_else(|| chrono::Duration::days(36_500))
}

enum Attempt {
    Outcome(Result<ActionOutcome, ActionError>),
    TimedOut,
}

/// Runs action handlers for due tasks.
pub struct ActionDispatcher {
    registry: ActionRegistry,
    policy: RetryPolicy,
    action_timeout: Duration,
    claim_timeout: chrono::Duration,
    batch_size: usize,
    permits: Arc<Semaphore>,
    event_bus: EventBus,
}

impl ActionDispatcher {
    pub fn new(registry: ActionRegistry, config: &EngineConfig, event_bus: EventBus) -> Self {
        Self {
            registry,
            policy: config.retry.clone(),
            action_timeout: Duration::from_secs(config.action_timeout_secs.max(1)),
            claim_timeout: claim_window(config),
            batch_size: config.dispatch_batch_size.max(1),
            permits: Arc::new(Semaphore::new(config.dispatch_concurrency.max(1))),
            event_bus,
        }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Claim and run every task due at the clock's current time.
    pub async fn dispatch_due<R: WorkflowRepository>(
        &self,
        repo: &R,
        clock: &dyn Clock,
    ) -> Result<(DispatchReport, Vec<DispatchCompletion>), RepositoryError> {
        let now = clock.now();
        let claimed = repo
            .claim_due_tasks(
                now,
                self.batch_size,
                now.checked_add_signed(self.claim_timeout)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            )
            .await?;

        let mut report = DispatchReport {
            claimed: claimed.len(),
            ..DispatchReport::default()
        };
        let mut completions = Vec::new();
        let mut running: JoinSet<(ActionTask, Attempt)> = JoinSet::new();

        for mut task in claimed {
            let instance = repo.get_instance(&task.instance_id).await?;
            let Some(instance) = instance.filter(|i| !i.is_terminal()) else {
                tracing::debug!(task_id = %task.id, "dropping task of finished instance");
                task.status = ActionTaskStatus::Cancelled;
                task.updated_at = now;
                repo.update_task(&task).await?;
                report.skipped += 1;
                continue;
            };

            if let Some(result) = repo.get_action_result(&task.idempotency_token).await? {
                tracing::debug!(
                    task_id = %task.id,
                    token = task.idempotency_token.as_str(),
                    "idempotency ledger hit, handler not called"
                );
                report.replayed += 1;
                self.finish_success(repo, task, result, now, &mut report, &mut completions)
                    .await?;
                continue;
            }

            let Some(handler) = self.registry.get(&task.action_type) else {
                let error = ActionError::Permanent(format!(
                    "no handler registered for action type '{}'",
                    task.action_type
                ));
                task.attempt += 1;
                self.finish_failure(repo, task, &error, now, &mut report, &mut completions)
                    .await?;
                continue;
            };

            task.attempt += 1;
            let ctx = ActionContext {
                task_id: task.id,
                instance_id: task.instance_id,
                node_id: task.node_id.clone(),
                subject_id: instance.subject_id.clone(),
                attempt: task.attempt,
                idempotency_token: task.idempotency_token.clone(),
            };
            self.event_bus.publish(EngineEvent::ActionDispatched {
                instance_id: task.instance_id,
                task_id: task.id,
                action_type: task.action_type.clone(),
                attempt: task.attempt,
            });
            tracing::debug!(
                task_id = %task.id,
                instance_id = %task.instance_id,
                action_type = task.action_type.as_str(),
                attempt = task.attempt,
                "dispatching action"
            );

            let permits = Arc::clone(&self.permits);
            let timeout = self.action_timeout;
            report.invoked += 1;
            running.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let attempt =
                    match tokio::time::timeout(timeout, handler.execute_boxed(&task.payload, &ctx))
                        .await
                    {
                        Ok(outcome) => Attempt::Outcome(outcome),
                        Err(_) => Attempt::TimedOut,
                    };
                (task, attempt)
            });
        }

        while let Some(joined) = running.join_next().await {
            let (task, attempt) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    // The task is lost with the panicking future; its claim
                    // expires and the due-task scan redelivers it.
                    tracing::error!(error = %e, "action handler task panicked");
                    continue;
                }
            };
            let now = clock.now();
            match attempt {
                Attempt::Outcome(Ok(ActionOutcome::Succeeded { result })) => {
                    repo.record_action_result(&task.idempotency_token, &result)
                        .await?;
                    self.finish_success(repo, task, result, now, &mut report, &mut completions)
                        .await?;
                }
                Attempt::Outcome(Ok(ActionOutcome::Deferred)) => {
                    let mut task = task;
                    task.status = ActionTaskStatus::AwaitingCallback;
                    task.updated_at = now;
                    if self.store_unless_cancelled(repo, &task).await? {
                        report.deferred += 1;
                        tracing::debug!(task_id = %task.id, "action deferred to callback");
                    }
                }
                Attempt::Outcome(Err(error)) => {
                    self.finish_failure(repo, task, &error, now, &mut report, &mut completions)
                        .await?;
                }
                Attempt::TimedOut => {
                    let error = ActionError::Transient(format!(
                        "handler timed out after {}s",
                        self.action_timeout.as_secs()
                    ));
                    self.finish_failure(repo, task, &error, now, &mut report, &mut completions)
                        .await?;
                }
            }
        }

        if report.claimed > 0 {
            tracing::debug!(?report, "dispatch pass finished");
        }
        Ok((report, completions))
    }

    async fn finish_success<R: WorkflowRepository>(
        &self,
        repo: &R,
        mut task: ActionTask,
        result: Value,
        now: DateTime<Utc>,
        report: &mut DispatchReport,
        completions: &mut Vec<DispatchCompletion>,
    ) -> Result<(), RepositoryError> {
        task.status = ActionTaskStatus::Succeeded;
        task.last_error = None;
        task.updated_at = now;
        if !self.store_unless_cancelled(repo, &task).await? {
            return Ok(());
        }
        report.succeeded += 1;
        completions.push(DispatchCompletion {
            instance_id: task.instance_id,
            task_id: task.id,
            signal: ResumeSignal::ActionCompleted {
                task_id: task.id,
                result,
            },
        });
        Ok(())
    }

    /// Reschedule a transient failure with backoff, or fail the task.
    async fn finish_failure<R: WorkflowRepository>(
        &self,
        repo: &R,
        mut task: ActionTask,
        error: &ActionError,
        now: DateTime<Utc>,
        report: &mut DispatchReport,
        completions: &mut Vec<DispatchCompletion>,
    ) -> Result<(), RepositoryError> {
        task.last_error = Some(error.message().to_string());
        task.updated_at = now;

        if error.is_transient() && RetryHandler::should_retry(task.max_attempts, task.attempt) {
            let delay = RetryHandler::delay(&self.policy, task.attempt.saturating_sub(1));
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
            task.status = ActionTaskStatus::Pending;
            task.next_retry_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
            if !self.store_unless_cancelled(repo, &task).await? {
                return Ok(());
            }
            report.retried += 1;
            tracing::warn!(
                task_id = %task.id,
                instance_id = %task.instance_id,
                attempt = task.attempt,
                max_attempts = task.max_attempts,
                next_retry_at = %task.next_retry_at,
                error = error.message(),
                "transient action failure, retry scheduled"
            );
            self.event_bus.publish(EngineEvent::ActionRetryScheduled {
                instance_id: task.instance_id,
                task_id: task.id,
                attempt: task.attempt,
                next_retry_at: task.next_retry_at,
            });
            return Ok(());
        }

        let message = if error.is_transient() {
            format!(
                "action '{}' failed after {} attempts: {}",
                task.action_type,
                task.attempt,
                error.message()
            )
        } else {
            format!("action '{}' rejected: {}", task.action_type, error.message())
        };
        task.status = ActionTaskStatus::Failed;
        task.last_error = Some(message.clone());
        if !self.store_unless_cancelled(repo, &task).await? {
            return Ok(());
        }
        report.failed += 1;
        tracing::warn!(
            task_id = %task.id,
            instance_id = %task.instance_id,
            attempt = task.attempt,
            error = message.as_str(),
            "action failed permanently"
        );
        completions.push(DispatchCompletion {
            instance_id: task.instance_id,
            task_id: task.id,
            signal: ResumeSignal::ActionFailed {
                task_id: task.id,
                error: message,
            },
        });
        Ok(())
    }

    /// Write `task` unless it was cancelled while the handler ran.
    async fn store_unless_cancelled<R: WorkflowRepository>(
        &self,
        repo: &R,
        task: &ActionTask,
    ) -> Result<bool, RepositoryError> {
        let stored = repo.update_task(task).await?;
        if !stored {
            tracing::debug!(task_id = %task.id, "task cancelled during dispatch");
        }
        Ok(stored)
    }
}

impl std::fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("registry", &self.registry)
            .field("batch_size", &self.batch_size)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use cadence_types::instance::{InstanceStatus, WaitReason, WaitState, WorkflowInstance};
    use serde_json::json;

    use crate::repository::memory::InMemoryWorkflowRepository;
    use crate::repository::workflow::StepCommit;
    use crate::workflow::action::{ActionContext, ActionHandler, LogActionHandler};
    use crate::workflow::clock::ManualClock;

    struct SlowHandler;

    impl ActionHandler for SlowHandler {
        fn action_type(&self) -> &str {
            "slow"
        }

        async fn execute(
            &self,
            _payload: &Value,
            _ctx: &ActionContext,
        ) -> Result<ActionOutcome, ActionError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(ActionOutcome::Succeeded { result: Value::Null })
        }
    }

    async fn enqueue(repo: &InMemoryWorkflowRepository, action_type: &str, now: DateTime<Utc>) -> ActionTask {
        let instance = WorkflowInstance {
            id: Uuid::now_v7(),
            definition_id: Uuid::now_v7(),
            definition_version: 1,
            subject_id: "lead-7".into(),
            current_node: "act".into(),
            variables: BTreeMap::new(),
            trigger_payload: json!({}),
            status: InstanceStatus::Running,
            wait: None,
            loop_counters: BTreeMap::new(),
            epoch: 0,
            error: None,
            created_at: now,
            updated_at: now,
        };
        repo.create_instance(&instance).await.unwrap();

        let task = ActionTask {
            id: Uuid::now_v7(),
            instance_id: instance.id,
            node_id: "act".into(),
            action_type: action_type.into(),
            payload: json!({ "to": "ana@example.com" }),
            attempt: 0,
            max_attempts: 2,
            next_retry_at: now,
            status: ActionTaskStatus::Pending,
            idempotency_token: format!("token-{}", instance.id),
            epoch: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        let mut waiting = instance.clone();
        waiting.status = InstanceStatus::Waiting;
        waiting.wait = Some(WaitState {
            reason: WaitReason::Action {
                task_id: task.id,
                token: task.idempotency_token.clone(),
            },
            entered_at: now,
        });
        waiting.epoch = 1;
        let mut commit = StepCommit::new(waiting, 0);
        commit.enqueue = Some(task.clone());
        repo.commit_step(&commit).await.unwrap();
        task
    }

    fn dispatcher(registry: ActionRegistry) -> ActionDispatcher {
        let config = EngineConfig {
            action_timeout_secs: 1,
            ..EngineConfig::default()
        };
        ActionDispatcher::new(registry, &config, EventBus::new(16))
    }

    #[test]
    fn test_claim_outlives_action_timeout() {
        let config = EngineConfig {
            action_timeout_secs: 30,
            claim_timeout_secs: 1,
            ..EngineConfig::default()
        };
        let d = ActionDispatcher::new(ActionRegistry::new(), &config, EventBus::new(16));
        assert_eq!(
            d.claim_timeout,
            chrono::Duration::seconds((30 + CLAIM_MARGIN_SECS) as i64)
        );

        let roomy = EngineConfig {
            action_timeout_secs: 30,
            claim_timeout_secs: 600,
            ..EngineConfig::default()
        };
        let d = ActionDispatcher::new(ActionRegistry::new(), &roomy, EventBus::new(16));
        assert_eq!(d.claim_timeout, chrono::Duration::seconds(600));

        let huge = EngineConfig {
            claim_timeout_secs: u64::MAX,
            ..EngineConfig::default()
        };
        let d = ActionDispatcher::new(ActionRegistry::new(), &huge, EventBus::new(16));
        assert!(d.claim_timeout > chrono::Duration::days(365));
    }

    #[tokio::test]
    async fn test_success_records_ledger_and_completion() {
        let repo = InMemoryWorkflowRepository::new();
        let clock = ManualClock::new(Utc::now());
        let task = enqueue(&repo, "log", clock.now()).await;
        let d = dispatcher(ActionRegistry::new().with(LogActionHandler::default()));

        let (report, completions) = d.dispatch_due(&repo, &clock).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].task_id, task.id);
        assert!(repo.get_action_result(&task.idempotency_token).await.unwrap().is_some());
        let stored = repo.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionTaskStatus::Succeeded);
        assert_eq!(stored.attempt, 1);
    }

    #[tokio::test]
    async fn test_missing_handler_is_permanent() {
        let repo = InMemoryWorkflowRepository::new();
        let clock = ManualClock::new(Utc::now());
        let task = enqueue(&repo, "place_call", clock.now()).await;
        let d = dispatcher(ActionRegistry::new());

        let (report, completions) = d.dispatch_due(&repo, &clock).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.invoked, 0);
        assert!(matches!(
            &completions[0].signal,
            ResumeSignal::ActionFailed { task_id, .. } if *task_id == task.id
        ));
    }

    #[tokio::test]
    async fn test_timeout_is_retried_with_backoff() {
        let repo = InMemoryWorkflowRepository::new();
        let clock = ManualClock::new(Utc::now());
        let task = enqueue(&repo, "slow", clock.now()).await;
        let d = dispatcher(ActionRegistry::new().with(SlowHandler));

        let (report, completions) = d.dispatch_due(&repo, &clock).await.unwrap();
        assert_eq!(report.retried, 1);
        assert!(completions.is_empty());
        let stored = repo.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionTaskStatus::Pending);
        assert!(stored.next_retry_at > clock.now());
        assert!(stored.last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_task_of_finished_instance_is_dropped() {
        let repo = InMemoryWorkflowRepository::new();
        let clock = ManualClock::new(Utc::now());
        let task = enqueue(&repo, "log", clock.now()).await;
        let mut instance = repo.get_instance(&task.instance_id).await.unwrap().unwrap();
        instance.status = InstanceStatus::Completed;
        instance.wait = None;
        instance.epoch = 2;
        repo.commit_step(&StepCommit::new(instance, 1)).await.unwrap();

        let d = dispatcher(ActionRegistry::new().with(LogActionHandler::default()));
        let (report, completions) = d.dispatch_due(&repo, &clock).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(completions.is_empty());
        let stored = repo.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionTaskStatus::Cancelled);
    }
}
