//! Infrastructure layer for Cadence.
//!
//! Contains the SQLite implementation of the `WorkflowRepository` trait
//! defined in `cadence-core` and the TOML configuration loader.

pub mod config;
pub mod sqlite;
