//! Execution scheduler: the per-instance state machine.
//!
//! `Scheduler::plan` is pure. Given the bound definition, the stored
//! instance, an optional resume signal and the subject snapshot, it walks pure
//! nodes until the instance parks (`Waiting`), finishes, or hits the step cap,
//! and returns a [`StepPlan`]: one [`StepCommit`] for the repository plus the
//! wakes and engine events to emit once the commit lands. The engine applies
//! plans under the instance lease.

use cadence_types::config::RetryPolicy;
use cadence_types::event::{
    ACTION_COMPLETED_EVENT, ACTION_FAILED_EVENT, EngineEvent, InboundEvent, ResumeSignal,
};
use cadence_types::instance::{
    ActionTask, ActionTaskStatus, InstanceStatus, NodeExecutionRecord, NodeOutcome, WaitReason,
    WaitState, WorkflowInstance,
};
use cadence_types::workflow::{
    Edge, EdgeRoute, Node, NodeConfig, NodeType, Predicate, WorkflowDefinition,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::repository::workflow::{StepCommit, TaskFinish};

use super::condition::evaluate_predicate;
use super::context::EvaluationContext;
use super::retry::RetryHandler;
use super::timer::Wake;
use super::trigger::callback_task_id;

// ---------------------------------------------------------------------------
// Plan types
// ---------------------------------------------------------------------------

/// Everything one scheduler step produces.
#[derive(Debug, Clone, PartialEq)]
pub struct StepPlan {
    pub commit: StepCommit,
    /// Delay wakes to schedule after the commit.
    pub wakes: Vec<Wake>,
    /// Events to publish after the commit.
    pub events: Vec<EngineEvent>,
}

impl StepPlan {
    pub fn instance(&self) -> &WorkflowInstance {
        &self.commit.instance
    }
}

/// Result of planning against the stored instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    Planned(StepPlan),
    /// The signal does not apply to the instance's current state.
    Ignored { reason: &'static str },
}

/// Deterministic idempotency token for an action node entry.
///
/// Hex SHA-256 of `instance_id:node_id:epoch`.
pub fn idempotency_token(instance_id: &Uuid, node_id: &str, epoch: u64) -> String {
    let digest = Sha256::digest(format!("{instance_id}:{node_id}:{epoch}").as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Scheduler {
    policy: RetryPolicy,
    max_steps: u32,
}

impl Scheduler {
    pub fn new(policy: RetryPolicy, max_steps: u32) -> Self {
        Self {
            policy,
            max_steps: max_steps.max(1),
        }
    }

    /// Plan the next step for `current`.
    ///
    /// Without a signal the instance must be `Pending` or `Running`. With a
    /// signal it must be `Waiting` on exactly what the signal resolves.
    pub fn plan(
        &self,
        def: &WorkflowDefinition,
        current: &WorkflowInstance,
        signal: Option<&ResumeSignal>,
        subject: &Value,
        next_sequence: u32,
        now: DateTime<Utc>,
    ) -> Advance {
        if current.is_terminal() {
            return Advance::Ignored {
                reason: "instance is terminal",
            };
        }

        let mut walk = Walk::new(self, def, current, subject, next_sequence, now);
        match signal {
            None => match current.status {
                InstanceStatus::Pending | InstanceStatus::Running => {
                    walk.instance.status = InstanceStatus::Running;
                }
                _ => {
                    return Advance::Ignored {
                        reason: "instance is waiting",
                    };
                }
            },
            Some(signal) => {
                if let Err(reason) = walk.resume(signal) {
                    return Advance::Ignored { reason };
                }
            }
        }
        walk.run();
        Advance::Planned(walk.finish())
    }

    /// Plan the cancellation of a non-terminal instance.
    ///
    /// Returns `None` for terminal instances.
    pub fn plan_cancel(
        &self,
        current: &WorkflowInstance,
        node_type: Option<NodeType>,
        next_sequence: u32,
        now: DateTime<Utc>,
    ) -> Option<StepPlan> {
        if current.is_terminal() {
            return None;
        }
        let mut instance = current.clone();
        let mut records = Vec::new();
        if let (Some(wait), Some(node_type)) = (&current.wait, node_type) {
            records.push(NodeExecutionRecord {
                sequence: next_sequence,
                node_id: current.current_node.clone(),
                node_type,
                entered_at: wait.entered_at,
                exited_at: now,
                outcome: NodeOutcome::Cancelled,
                error: None,
            });
        }
        instance.status = InstanceStatus::Cancelled;
        instance.wait = None;
        instance.epoch = current.epoch + 1;
        instance.updated_at = now;

        let mut commit = StepCommit::new(instance, current.epoch);
        commit.records = records;
        commit.cancel_open_tasks = true;
        Some(StepPlan {
            commit,
            wakes: Vec::new(),
            events: vec![EngineEvent::InstanceCancelled {
                instance_id: current.id,
            }],
        })
    }
}

// ---------------------------------------------------------------------------
// Walk: one step in progress
// ---------------------------------------------------------------------------

enum Flow {
    Continue,
    Stop,
}

struct Walk<'a> {
    scheduler: &'a Scheduler,
    def: &'a WorkflowDefinition,
    subject: &'a Value,
    now: DateTime<Utc>,
    expected_epoch: u64,
    instance: WorkflowInstance,
    next_sequence: u32,
    records: Vec<NodeExecutionRecord>,
    enqueue: Option<ActionTask>,
    finish_task: Option<TaskFinish>,
    wakes: Vec<Wake>,
    events: Vec<EngineEvent>,
}

impl<'a> Walk<'a> {
    fn new(
        scheduler: &'a Scheduler,
        def: &'a WorkflowDefinition,
        current: &WorkflowInstance,
        subject: &'a Value,
        next_sequence: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let mut instance = current.clone();
        instance.epoch = current.epoch + 1;
        instance.updated_at = now;
        Self {
            scheduler,
            def,
            subject,
            now,
            expected_epoch: current.epoch,
            instance,
            next_sequence,
            records: Vec::new(),
            enqueue: None,
            finish_task: None,
            wakes: Vec::new(),
            events: Vec::new(),
        }
    }

    fn finish(self) -> StepPlan {
        let mut commit = StepCommit::new(self.instance, self.expected_epoch);
        commit.records = self.records;
        commit.enqueue = self.enqueue;
        commit.finish_task = self.finish_task;
        StepPlan {
            commit,
            wakes: self.wakes,
            events: self.events,
        }
    }

    // -- resume -------------------------------------------------------------

    /// Apply a resume signal to a waiting instance.
    fn resume(&mut self, signal: &ResumeSignal) -> Result<(), &'static str> {
        if self.instance.status != InstanceStatus::Waiting {
            return Err("instance is not waiting");
        }
        let Some(wait) = self.instance.wait.clone() else {
            return Err("instance has no wait state");
        };
        let node = self.current_node().ok_or("current node missing")?;

        match (signal, &wait.reason) {
            (ResumeSignal::ActionCompleted { task_id, result }, WaitReason::Action { task_id: waiting, .. })
                if task_id == waiting =>
            {
                self.resumed(node.id.as_str());
                if !result.is_null() {
                    self.instance.variables.insert(node.id.clone(), result.clone());
                }
                self.finish_task = Some(TaskFinish {
                    task_id: *task_id,
                    status: ActionTaskStatus::Succeeded,
                    error: None,
                });
                match self.def.next_edge(&node.id) {
                    Some(edge) => {
                        let outcome = NodeOutcome::ActionSucceeded {
                            edge_id: edge.id.clone(),
                        };
                        self.record(node, wait.entered_at, outcome, None);
                        self.follow(edge);
                    }
                    None => self.fail(node, wait.entered_at, "action node has no next edge".into()),
                }
                Ok(())
            }
            (ResumeSignal::ActionFailed { task_id, error }, WaitReason::Action { task_id: waiting, .. })
                if task_id == waiting =>
            {
                self.resumed(node.id.as_str());
                self.finish_task = Some(TaskFinish {
                    task_id: *task_id,
                    status: ActionTaskStatus::Failed,
                    error: Some(error.clone()),
                });
                match self.def.error_edge(&node.id) {
                    Some(edge) => {
                        let outcome = NodeOutcome::ActionFailed {
                            edge_id: edge.id.clone(),
                        };
                        self.record(node, wait.entered_at, outcome, Some(error.clone()));
                        self.follow(edge);
                    }
                    None => self.fail(node, wait.entered_at, error.clone()),
                }
                Ok(())
            }
            (ResumeSignal::DelayElapsed { epoch }, WaitReason::Delay { resume_at }) => {
                if *epoch != self.expected_epoch {
                    return Err("stale delay wake");
                }
                if *resume_at > self.now {
                    return Err("delay not yet due");
                }
                self.resumed(node.id.as_str());
                match self.def.next_edge(&node.id) {
                    Some(edge) => {
                        let outcome = NodeOutcome::DelayElapsed {
                            edge_id: edge.id.clone(),
                        };
                        self.record(node, wait.entered_at, outcome, None);
                        self.follow(edge);
                    }
                    None => self.fail(node, wait.entered_at, "delay node has no next edge".into()),
                }
                Ok(())
            }
            (ResumeSignal::External(event), WaitReason::Action { .. }) => {
                let converted = callback_signal(event).ok_or("event does not resolve the wait")?;
                self.resume(&converted)
            }
            (ResumeSignal::ActionCompleted { .. } | ResumeSignal::ActionFailed { .. }, _) => {
                Err("signal is for another task")
            }
            _ => Err("signal does not match the wait"),
        }
    }

    fn resumed(&mut self, node_id: &str) {
        tracing::debug!(
            instance_id = %self.instance.id,
            node_id,
            epoch = self.expected_epoch,
            "instance resumed"
        );
        self.instance.status = InstanceStatus::Running;
        self.instance.wait = None;
    }

    // -- node execution -----------------------------------------------------

    fn run(&mut self) {
        let mut steps = 0;
        while self.instance.status == InstanceStatus::Running {
            if steps >= self.scheduler.max_steps {
                tracing::debug!(
                    instance_id = %self.instance.id,
                    steps,
                    "step cap reached, instance stays running"
                );
                break;
            }
            steps += 1;
            let Some(node) = self.current_node() else {
                let missing = self.instance.current_node.clone();
                self.abort(format!("node '{missing}' not found in definition"));
                break;
            };
            if let Flow::Stop = self.execute(node) {
                break;
            }
        }
    }

    fn execute(&mut self, node: &'a Node) -> Flow {
        let entered = self.now;
        match &node.config {
            NodeConfig::Trigger { .. } | NodeConfig::Merge {} => {
                match self.def.next_edge(&node.id) {
                    Some(edge) => {
                        if !matches!(node.config, NodeConfig::Trigger { .. }) {
                            let outcome = NodeOutcome::Advanced {
                                edge_id: edge.id.clone(),
                            };
                            self.record(node, entered, outcome, None);
                        }
                        self.follow(edge);
                        Flow::Continue
                    }
                    None => {
                        self.fail(node, entered, format!("node '{}' has no next edge", node.id));
                        Flow::Stop
                    }
                }
            }
            NodeConfig::Condition {} => self.execute_condition(node),
            NodeConfig::Action {
                action_type,
                payload,
                max_attempts,
            } => self.execute_action(node, action_type, payload, *max_attempts),
            NodeConfig::Delay { .. } => self.execute_delay(node),
            NodeConfig::Loop {
                max_iterations,
                repeat_while,
            } => self.execute_loop(node, *max_iterations, repeat_while.as_ref()),
            NodeConfig::Terminal {} => {
                self.record(node, entered, NodeOutcome::Completed, None);
                self.instance.status = InstanceStatus::Completed;
                self.events.push(EngineEvent::InstanceCompleted {
                    instance_id: self.instance.id,
                });
                Flow::Stop
            }
        }
    }

    fn execute_condition(&mut self, node: &'a Node) -> Flow {
        let entered = self.now;
        let mut chosen: Option<(&'a Edge, String)> = None;
        let mut failure = None;
        {
            let ctx = self.context();
            for edge in self.def.outgoing(&node.id) {
                if let EdgeRoute::Branch { key, predicate } = &edge.route {
                    match evaluate_predicate(predicate, &ctx) {
                        Ok(true) => {
                            chosen = Some((edge, key.clone()));
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            failure = Some(format!("branch '{key}': {e}"));
                            break;
                        }
                    }
                }
            }
        }
        if let Some(error) = failure {
            return self.route_error(node, entered, error);
        }
        if chosen.is_none() {
            chosen = self.def.outgoing(&node.id).find_map(|edge| match &edge.route {
                EdgeRoute::Default { key } => Some((edge, key.clone())),
                _ => None,
            });
        }
        match chosen {
            Some((edge, key)) => {
                let outcome = NodeOutcome::Branched {
                    key,
                    edge_id: edge.id.clone(),
                };
                self.record(node, entered, outcome, None);
                self.follow(edge);
                Flow::Continue
            }
            None => {
                self.fail(node, entered, "no matching branch".into());
                Flow::Stop
            }
        }
    }

    fn execute_action(
        &mut self,
        node: &'a Node,
        action_type: &str,
        payload: &Value,
        max_attempts: Option<u32>,
    ) -> Flow {
        let rendered = self.context().render(payload);
        let rendered = match rendered {
            Ok(v) => v,
            Err(e) => return self.route_error(node, self.now, format!("payload: {e}")),
        };

        let token = idempotency_token(&self.instance.id, &node.id, self.expected_epoch);
        let task = ActionTask {
            id: Uuid::now_v7(),
            instance_id: self.instance.id,
            node_id: node.id.clone(),
            action_type: action_type.to_string(),
            payload: rendered,
            attempt: 0,
            max_attempts: RetryHandler::max_attempts(&self.scheduler.policy, max_attempts),
            next_retry_at: self.now,
            status: ActionTaskStatus::Pending,
            idempotency_token: token.clone(),
            epoch: self.expected_epoch,
            last_error: None,
            created_at: self.now,
            updated_at: self.now,
        };
        self.park(
            node,
            WaitReason::Action {
                task_id: task.id,
                token,
            },
        );
        self.enqueue = Some(task);
        Flow::Stop
    }

    fn execute_delay(&mut self, node: &'a Node) -> Flow {
        let entered = self.now;
        let Some(spec) = node.config.delay_spec() else {
            self.fail(node, entered, "delay node has no duration".into());
            return Flow::Stop;
        };
        let resume_at = spec.resume_at(self.now);
        if resume_at > self.now {
            self.park(node, WaitReason::Delay { resume_at });
            self.wakes.push(Wake {
                resume_at,
                instance_id: self.instance.id,
                epoch: self.instance.epoch,
            });
            return Flow::Stop;
        }
        match self.def.next_edge(&node.id) {
            Some(edge) => {
                let outcome = NodeOutcome::DelayElapsed {
                    edge_id: edge.id.clone(),
                };
                self.record(node, entered, outcome, None);
                self.follow(edge);
                Flow::Continue
            }
            None => {
                self.fail(node, entered, "delay node has no next edge".into());
                Flow::Stop
            }
        }
    }

    fn execute_loop(
        &mut self,
        node: &'a Node,
        max_iterations: u32,
        repeat_while: Option<&Predicate>,
    ) -> Flow {
        let entered = self.now;
        let count = self.instance.loop_counters.get(&node.id).copied().unwrap_or(0);
        let wants_repeat = match repeat_while {
            None => Ok(true),
            Some(predicate) => evaluate_predicate(predicate, &self.context()),
        };
        let wants_repeat = match wants_repeat {
            Ok(b) => b,
            Err(e) => return self.route_error(node, entered, format!("loop condition: {e}")),
        };

        let repeat = self
            .def
            .outgoing(&node.id)
            .find(|e| matches!(e.route, EdgeRoute::Repeat));
        if wants_repeat && count < max_iterations {
            if let Some(edge) = repeat {
                let iteration = count + 1;
                self.instance.loop_counters.insert(node.id.clone(), iteration);
                let outcome = NodeOutcome::LoopRepeated {
                    iteration,
                    edge_id: edge.id.clone(),
                };
                self.record(node, entered, outcome, None);
                self.follow(edge);
                return Flow::Continue;
            }
        }

        self.instance.loop_counters.remove(&node.id);
        match self.def.next_edge(&node.id) {
            Some(edge) => {
                let outcome = NodeOutcome::LoopExited {
                    iterations: count,
                    edge_id: edge.id.clone(),
                };
                self.record(node, entered, outcome, None);
                self.follow(edge);
                Flow::Continue
            }
            None => {
                self.fail(node, entered, "loop node has no exit edge".into());
                Flow::Stop
            }
        }
    }

    // -- helpers ------------------------------------------------------------

    fn current_node(&self) -> Option<&'a Node> {
        self.def.node(&self.instance.current_node)
    }

    fn context(&self) -> EvaluationContext<'_> {
        EvaluationContext::new(
            &self.instance.variables,
            self.subject,
            &self.instance.trigger_payload,
        )
    }

    fn record(
        &mut self,
        node: &Node,
        entered_at: DateTime<Utc>,
        outcome: NodeOutcome,
        error: Option<String>,
    ) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.records.push(NodeExecutionRecord {
            sequence,
            node_id: node.id.clone(),
            node_type: node.node_type,
            entered_at,
            exited_at: self.now,
            outcome,
            error,
        });
        self.events.push(EngineEvent::NodeExecuted {
            instance_id: self.instance.id,
            node_id: node.id.clone(),
            sequence,
        });
    }

    fn follow(&mut self, edge: &Edge) {
        self.instance.current_node = edge.target.clone();
    }

    fn park(&mut self, node: &Node, reason: WaitReason) {
        self.events.push(EngineEvent::InstanceWaiting {
            instance_id: self.instance.id,
            node_id: node.id.clone(),
            reason: reason.label().to_string(),
        });
        self.instance.status = InstanceStatus::Waiting;
        self.instance.wait = Some(WaitState {
            reason,
            entered_at: self.now,
        });
    }

    /// Take the node's on-error edge, or fail the instance.
    fn route_error(&mut self, node: &'a Node, entered_at: DateTime<Utc>, error: String) -> Flow {
        match self.def.error_edge(&node.id) {
            Some(edge) => {
                tracing::debug!(
                    instance_id = %self.instance.id,
                    node_id = node.id.as_str(),
                    error = error.as_str(),
                    "evaluation error routed to error edge"
                );
                let outcome = NodeOutcome::Errored {
                    edge_id: edge.id.clone(),
                };
                self.record(node, entered_at, outcome, Some(error));
                self.follow(edge);
                Flow::Continue
            }
            None => {
                self.fail(node, entered_at, error);
                Flow::Stop
            }
        }
    }

    fn fail(&mut self, node: &Node, entered_at: DateTime<Utc>, error: String) {
        self.record(node, entered_at, NodeOutcome::Failed, Some(error.clone()));
        self.abort(error);
    }

    fn abort(&mut self, error: String) {
        self.instance.status = InstanceStatus::Failed;
        self.instance.wait = None;
        self.instance.error = Some(error.clone());
        self.events.push(EngineEvent::InstanceFailed {
            instance_id: self.instance.id,
            error,
        });
    }
}

/// Resume signal carried by an `action.completed` / `action.failed` event.
pub fn callback_signal(event: &InboundEvent) -> Option<ResumeSignal> {
    let task_id = callback_task_id(event)?;
    match event.event_type.as_str() {
        ACTION_COMPLETED_EVENT => Some(ResumeSignal::ActionCompleted {
            task_id,
            result: event.payload.get("result").cloned().unwrap_or(Value::Null),
        }),
        ACTION_FAILED_EVENT => Some(ResumeSignal::ActionFailed {
            task_id,
            error: event
                .payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("action failed")
                .to_string(),
        }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
