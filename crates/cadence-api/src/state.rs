//! Application state wiring the engine to its storage.
//!
//! `AppState` pins the generic `WorkflowEngine` to the SQLite repository
//! and the built-in action handlers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use cadence_core::workflow::action::LogActionHandler;
use cadence_core::workflow::{ActionRegistry, RecoveryReport, WorkflowEngine};
use cadence_infra::config::{load_engine_config, resolve_data_dir};
use cadence_infra::sqlite::pool::database_url_in;
use cadence_infra::sqlite::{DatabasePool, SqliteWorkflowRepository};

/// The engine as the CLI runs it.
pub type Engine = WorkflowEngine<SqliteWorkflowRepository>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Open the database in `data_dir` (or the resolved default), load
    /// `cadence.toml`, and build the engine.
    ///
    /// `simulated` action types are served by the log handler so that
    /// definitions using them validate and run without integrations.
    pub async fn init(data_dir: Option<PathBuf>, simulated: &[String]) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(resolve_data_dir);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let pool = DatabasePool::new(&database_url_in(&data_dir))
            .await
            .with_context(|| format!("Failed to open database in {}", data_dir.display()))?;
        let repo = Arc::new(SqliteWorkflowRepository::new(pool));

        let engine = WorkflowEngine::new(repo, registry(simulated), config);
        tracing::debug!(data_dir = %data_dir.display(), ?engine, "engine ready");

        Ok(Self {
            engine: Arc::new(engine),
            data_dir,
        })
    }

    /// Register published triggers and restore durable runtime state.
    pub async fn recover(&self) -> anyhow::Result<RecoveryReport> {
        self.engine
            .recover()
            .await
            .context("Failed to recover engine state")
    }
}

fn registry(simulated: &[String]) -> ActionRegistry {
    let mut registry = ActionRegistry::new().with(LogActionHandler::default());
    for action_type in simulated.iter().filter(|t| !t.is_empty()) {
        registry.register(LogActionHandler::for_type(action_type.clone()));
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_includes_log_and_simulated() {
        let registry = registry(&["send_email".to_string(), String::new()]);
        assert_eq!(registry.action_types(), vec!["log", "send_email"]);
    }

    #[tokio::test]
    async fn test_init_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("nested");
        let state = AppState::init(Some(data_dir.clone()), &[]).await.unwrap();
        assert!(data_dir.join("cadence.db").exists());
        assert_eq!(state.recover().await.unwrap(), RecoveryReport::default());
    }
}
