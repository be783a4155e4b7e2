//! Repository trait definitions (ports) and the in-memory adapter.
//!
//! The trait defines the storage interface that the infrastructure layer
//! (cadence-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod memory;
pub mod workflow;

pub use memory::InMemoryWorkflowRepository;
pub use workflow::{StepCommit, TaskFinish, WorkflowRepository};
