//! Workflow engine core: graph model checks, evaluation, dispatch and stepping.
//!
//! - `definition` -- YAML/JSON parsing, filesystem load/save and discovery
//! - `validator` -- structural checks run before publish
//! - `context` -- evaluation context, field paths and payload templates
//! - `condition` -- pure predicate evaluation for branch edges and loops
//! - `expression` -- JEXL evaluator for trigger `when` clauses
//! - `retry` -- exponential backoff with bounded jitter
//! - `action` -- action handler capability and registry
//! - `dispatcher` -- claims due action tasks and applies the retry policy
//! - `trigger` -- trigger registry, event routing and variable binding
//! - `scheduler` -- pure per-instance state machine producing step commits
//! - `lease` -- per-instance exclusivity
//! - `timer` -- time-ordered wake queue for delay nodes
//! - `clock` / `subject` -- time and subject snapshot capabilities
//! - `engine` -- the facade that applies steps and runs background workers

pub mod action;
pub mod clock;
pub mod condition;
pub mod context;
pub mod definition;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod expression;
pub mod lease;
pub mod retry;
pub mod scheduler;
pub mod subject;
pub mod timer;
pub mod trigger;
pub mod validator;

#[cfg(test)]
pub mod testing;

pub use action::{ActionContext, ActionError, ActionHandler, ActionOutcome, ActionRegistry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{RecoveryReport, StepResult, WorkflowEngine};
pub use error::EngineError;
pub use trigger::IngestOutcome;
