//! Engine error type returned by the `WorkflowEngine` facade.

use cadence_types::error::RepositoryError;
use cadence_types::instance::InstanceStatus;
use cadence_types::workflow::DefinitionRef;
use thiserror::Error;
use uuid::Uuid;

use super::expression::ExpressionError;
use super::validator::ValidationReport;

/// Errors surfaced to engine callers.
///
/// Runtime failures of a single instance (evaluation errors, action
/// failures) are not errors here: they are recorded in the instance history
/// and visible through `get_instance`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Structural problems found at publish time.
    #[error("definition is invalid: {0}")]
    Validation(ValidationReport),

    #[error("definition {0} not found")]
    DefinitionNotFound(Uuid),

    #[error("definition {0} not found")]
    VersionNotFound(DefinitionRef),

    #[error("definition {0} has no published version")]
    NotPublished(Uuid),

    #[error("instance {0} not found")]
    InstanceNotFound(Uuid),

    /// The trigger's `when` clause rejected the payload.
    #[error("trigger of {0} does not match the payload")]
    TriggerMismatch(DefinitionRef),

    #[error("trigger evaluation failed: {0}")]
    TriggerEvaluation(#[from] ExpressionError),

    #[error("instance {id} is already {status}")]
    AlreadyTerminal { id: Uuid, status: InstanceStatus },

    /// The scheduler lost the epoch race too many times in a row.
    #[error("instance {0}: commit conflicts exhausted retries")]
    ConflictRetriesExhausted(Uuid),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl EngineError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::ConflictRetriesExhausted(_) => true,
            EngineError::Repository(e) => !matches!(e, RepositoryError::NotFound),
            _ => false,
        }
    }
}

impl From<ValidationReport> for EngineError {
    fn from(report: ValidationReport) -> Self {
        EngineError::Validation(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display() {
        let id = Uuid::nil();
        let err = EngineError::AlreadyTerminal {
            id,
            status: InstanceStatus::Cancelled,
        };
        assert!(err.to_string().ends_with("is already cancelled"));

        let err: EngineError = RepositoryError::NotFound.into();
        assert_eq!(err.to_string(), "repository error: entity not found");
    }

    #[test]
    fn test_only_storage_hiccups_are_transient() {
        let id = Uuid::nil();
        assert!(EngineError::ConflictRetriesExhausted(id).is_transient());
        assert!(EngineError::from(RepositoryError::Query("locked".into())).is_transient());
        assert!(!EngineError::from(RepositoryError::NotFound).is_transient());
        assert!(!EngineError::InstanceNotFound(id).is_transient());
    }
}
