//! Observability setup for Cadence: the global `tracing` subscriber and the
//! optional OpenTelemetry span exporter.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, shutdown_tracing};
