use thiserror::Error;

/// Errors from repository operations (used by trait definitions in cadence-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    /// Optimistic concurrency failure (stale epoch or duplicate key).
    #[error("conflict: {0}")]
    Conflict(String),
}
