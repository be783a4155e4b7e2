//! Shared domain types for Cadence.
//!
//! This crate contains the domain types used across the Cadence workflow
//! engine: workflow definitions, instances, history records, action tasks,
//! events, engine configuration, and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod instance;
pub mod workflow;
