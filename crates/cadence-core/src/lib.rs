//! Workflow execution engine and repository trait definitions for Cadence.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements. It depends only on `cadence-types` -- never on
//! `cadence-infra` or any database crate.

pub mod event;
pub mod repository;
pub mod workflow;
