//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `cadence-core` using sqlx with split
//! read/write pools. Definitions are stored as JSON blobs; instances, history
//! records and action tasks get real columns so the scheduler and dispatcher
//! can filter on status and due time. `commit_step` and `claim_due_tasks`
//! run inside a writer transaction.

use cadence_core::repository::workflow::{StepCommit, WorkflowRepository};
use cadence_types::error::RepositoryError;
use cadence_types::instance::{
    ActionTask, ActionTaskStatus, InstanceStatus, NodeExecutionRecord, WorkflowInstance,
};
use cadence_types::workflow::WorkflowDefinition;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const INSTANCE_COLUMNS: &str = "id, definition_id, definition_version, subject_id, current_node, \
     variables, trigger_payload, status, wait, loop_counters, epoch, error, created_at, updated_at";

const TASK_COLUMNS: &str = "id, instance_id, node_id, action_type, payload, attempt, max_attempts, \
     next_retry_at, status, idempotency_token, epoch, last_error, created_at, updated_at";

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct InstanceRow {
    id: String,
    definition_id: String,
    definition_version: i64,
    subject_id: String,
    current_node: String,
    variables: String,
    trigger_payload: String,
    status: String,
    wait: Option<String>,
    loop_counters: String,
    epoch: i64,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl InstanceRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition_id: row.try_get("definition_id")?,
            definition_version: row.try_get("definition_version")?,
            subject_id: row.try_get("subject_id")?,
            current_node: row.try_get("current_node")?,
            variables: row.try_get("variables")?,
            trigger_payload: row.try_get("trigger_payload")?,
            status: row.try_get("status")?,
            wait: row.try_get("wait")?,
            loop_counters: row.try_get("loop_counters")?,
            epoch: row.try_get("epoch")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        let status: InstanceStatus = self.status.parse().map_err(RepositoryError::Query)?;
        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            definition_id: parse_uuid(&self.definition_id)?,
            definition_version: to_u32(self.definition_version, "definition_version")?,
            subject_id: self.subject_id,
            current_node: self.current_node,
            variables: from_json(&self.variables, "variables")?,
            trigger_payload: from_json(&self.trigger_payload, "trigger_payload")?,
            status,
            wait: self
                .wait
                .as_deref()
                .map(|s| from_json(s, "wait"))
                .transpose()?,
            loop_counters: from_json(&self.loop_counters, "loop_counters")?,
            epoch: to_u64(self.epoch, "epoch")?,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct HistoryRow {
    sequence: i64,
    node_id: String,
    node_type: String,
    entered_at: String,
    exited_at: String,
    outcome: String,
    error: Option<String>,
}

impl HistoryRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            sequence: row.try_get("sequence")?,
            node_id: row.try_get("node_id")?,
            node_type: row.try_get("node_type")?,
            entered_at: row.try_get("entered_at")?,
            exited_at: row.try_get("exited_at")?,
            outcome: row.try_get("outcome")?,
            error: row.try_get("error")?,
        })
    }

    fn into_record(self) -> Result<NodeExecutionRecord, RepositoryError> {
        let node_type = serde_json::from_value(serde_json::Value::String(self.node_type.clone()))
            .map_err(|_| RepositoryError::Query(format!("invalid node type: {}", self.node_type)))?;
        Ok(NodeExecutionRecord {
            sequence: to_u32(self.sequence, "sequence")?,
            node_id: self.node_id,
            node_type,
            entered_at: parse_datetime(&self.entered_at)?,
            exited_at: parse_datetime(&self.exited_at)?,
            outcome: from_json(&self.outcome, "outcome")?,
            error: self.error,
        })
    }
}

struct TaskRow {
    id: String,
    instance_id: String,
    node_id: String,
    action_type: String,
    payload: String,
    attempt: i64,
    max_attempts: i64,
    next_retry_at: String,
    status: String,
    idempotency_token: String,
    epoch: i64,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            node_id: row.try_get("node_id")?,
            action_type: row.try_get("action_type")?,
            payload: row.try_get("payload")?,
            attempt: row.try_get("attempt")?,
            max_attempts: row.try_get("max_attempts")?,
            next_retry_at: row.try_get("next_retry_at")?,
            status: row.try_get("status")?,
            idempotency_token: row.try_get("idempotency_token")?,
            epoch: row.try_get("epoch")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_task(self) -> Result<ActionTask, RepositoryError> {
        let status: ActionTaskStatus = self.status.parse().map_err(RepositoryError::Query)?;
        Ok(ActionTask {
            id: parse_uuid(&self.id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            node_id: self.node_id,
            action_type: self.action_type,
            payload: from_json(&self.payload, "payload")?,
            attempt: to_u32(self.attempt, "attempt")?,
            max_attempts: to_u32(self.max_attempts, "max_attempts")?,
            next_retry_at: parse_datetime(&self.next_retry_at)?,
            status,
            idempotency_token: self.idempotency_token,
            epoch: to_u64(self.epoch, "epoch")?,
            last_error: self.last_error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so that string comparison in SQL is chronological.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn to_json<T: Serialize + ?Sized>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

fn from_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_u32(v: i64, what: &str) -> Result<u32, RepositoryError> {
    u32::try_from(v).map_err(|_| RepositoryError::Query(format!("{what} out of range: {v}")))
}

fn to_u64(v: i64, what: &str) -> Result<u64, RepositoryError> {
    u64::try_from(v).map_err(|_| RepositoryError::Query(format!("{what} out of range: {v}")))
}

fn to_i64(v: u64, what: &str) -> Result<i64, RepositoryError> {
    i64::try_from(v).map_err(|_| RepositoryError::Query(format!("{what} out of range: {v}")))
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

/// Map UNIQUE / PRIMARY KEY violations to `Conflict`.
fn unique_or_query(e: sqlx::Error, conflict: impl FnOnce() -> String) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.message().contains("UNIQUE") {
            return RepositoryError::Conflict(conflict());
        }
    }
    RepositoryError::Query(e.to_string())
}

fn definitions_from_rows(rows: &[SqliteRow]) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
    rows.iter()
        .map(|row| {
            let json: String = row.try_get("definition").map_err(query_err)?;
            from_json(&json, "definition")
        })
        .collect()
}

fn instances_from_rows(rows: &[SqliteRow]) -> Result<Vec<WorkflowInstance>, RepositoryError> {
    rows.iter()
        .map(|row| {
            InstanceRow::from_row(row)
                .map_err(query_err)?
                .into_instance()
        })
        .collect()
}

fn tasks_from_rows(rows: &[SqliteRow]) -> Result<Vec<ActionTask>, RepositoryError> {
    rows.iter()
        .map(|row| TaskRow::from_row(row).map_err(query_err)?.into_task())
        .collect()
}

async fn insert_task(
    conn: &mut sqlx::SqliteConnection,
    task: &ActionTask,
) -> Result<(), RepositoryError> {
    sqlx::query(&format!(
        "INSERT INTO action_tasks ({TASK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(task.id.to_string())
    .bind(task.instance_id.to_string())
    .bind(&task.node_id)
    .bind(&task.action_type)
    .bind(to_json(&task.payload, "payload")?)
    .bind(i64::from(task.attempt))
    .bind(i64::from(task.max_attempts))
    .bind(format_datetime(&task.next_retry_at))
    .bind(task.status.as_str())
    .bind(&task.idempotency_token)
    .bind(to_i64(task.epoch, "epoch")?)
    .bind(&task.last_error)
    .bind(format_datetime(&task.created_at))
    .bind(format_datetime(&task.updated_at))
    .execute(&mut *conn)
    .await
    .map_err(|e| unique_or_query(e, || format!("task {} already exists", task.id)))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_draft(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO definition_drafts (id, name, definition, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(to_json(def, "definition")?)
        .bind(format_datetime(&def.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_draft(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM definition_drafts WHERE id = ?")
            .bind(id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        Ok(definitions_from_rows(&rows)?.into_iter().next())
    }

    async fn list_drafts(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM definition_drafts ORDER BY name ASC, id ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        definitions_from_rows(&rows)
    }

    async fn publish_version(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let published_at = def.published_at.unwrap_or(def.updated_at);
        sqlx::query(
            "INSERT INTO definition_versions (id, version, name, definition, published_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(def.id.to_string())
        .bind(i64::from(def.version))
        .bind(&def.name)
        .bind(to_json(def, "definition")?)
        .bind(format_datetime(&published_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            unique_or_query(e, || {
                format!("version {} of {} already published", def.version, def.id)
            })
        })?;
        Ok(())
    }

    async fn get_version(
        &self,
        id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let rows =
            sqlx::query("SELECT definition FROM definition_versions WHERE id = ? AND version = ?")
                .bind(id.to_string())
                .bind(i64::from(version))
                .fetch_all(&self.pool.reader)
                .await
                .map_err(query_err)?;
        Ok(definitions_from_rows(&rows)?.into_iter().next())
    }

    async fn latest_version(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT definition FROM definition_versions WHERE id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        Ok(definitions_from_rows(&rows)?.into_iter().next())
    }

    async fn list_published(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT v.definition FROM definition_versions v
               JOIN (SELECT id, MAX(version) AS version FROM definition_versions GROUP BY id) latest
                 ON latest.id = v.id AND latest.version = v.version
               ORDER BY v.name ASC, v.id ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        definitions_from_rows(&rows)
    }

    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        sqlx::query(&format!(
            "INSERT INTO instances ({INSTANCE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(instance.id.to_string())
        .bind(instance.definition_id.to_string())
        .bind(i64::from(instance.definition_version))
        .bind(&instance.subject_id)
        .bind(&instance.current_node)
        .bind(to_json(&instance.variables, "variables")?)
        .bind(to_json(&instance.trigger_payload, "trigger_payload")?)
        .bind(instance.status.as_str())
        .bind(instance.wait.as_ref().map(|w| to_json(w, "wait")).transpose()?)
        .bind(to_json(&instance.loop_counters, "loop_counters")?)
        .bind(to_i64(instance.epoch, "epoch")?)
        .bind(&instance.error)
        .bind(format_datetime(&instance.created_at))
        .bind(format_datetime(&instance.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| unique_or_query(e, || format!("instance {} already exists", instance.id)))?;
        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = ?"))
            .bind(id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        Ok(instances_from_rows(&rows)?.into_iter().next())
    }

    async fn commit_step(&self, commit: &StepCommit) -> Result<(), RepositoryError> {
        let instance = &commit.instance;
        let id = instance.id.to_string();
        let now = format_datetime(&instance.updated_at);

        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        // Compare-and-swap on the epoch. Nothing else is written on mismatch.
        let updated = sqlx::query(
            r#"UPDATE instances SET
                 current_node = ?, variables = ?, status = ?, wait = ?, loop_counters = ?,
                 epoch = ?, error = ?, updated_at = ?
               WHERE id = ? AND epoch = ?"#,
        )
        .bind(&instance.current_node)
        .bind(to_json(&instance.variables, "variables")?)
        .bind(instance.status.as_str())
        .bind(instance.wait.as_ref().map(|w| to_json(w, "wait")).transpose()?)
        .bind(to_json(&instance.loop_counters, "loop_counters")?)
        .bind(to_i64(instance.epoch, "epoch")?)
        .bind(&instance.error)
        .bind(&now)
        .bind(&id)
        .bind(to_i64(commit.expected_epoch, "epoch")?)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        if updated.rows_affected() == 0 {
            let stored: Option<(i64,)> = sqlx::query_as("SELECT epoch FROM instances WHERE id = ?")
                .bind(&id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_err)?;
            return match stored {
                None => Err(RepositoryError::NotFound),
                Some((epoch,)) => Err(RepositoryError::Conflict(format!(
                    "instance {id} is at epoch {epoch}, expected {}",
                    commit.expected_epoch
                ))),
            };
        }

        for record in &commit.records {
            sqlx::query(
                r#"INSERT INTO node_history
                   (instance_id, sequence, node_id, node_type, entered_at, exited_at, outcome, error)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&id)
            .bind(i64::from(record.sequence))
            .bind(&record.node_id)
            .bind(record.node_type.to_string())
            .bind(format_datetime(&record.entered_at))
            .bind(format_datetime(&record.exited_at))
            .bind(to_json(&record.outcome, "outcome")?)
            .bind(&record.error)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                unique_or_query(e, || {
                    format!("history sequence {} already written for {id}", record.sequence)
                })
            })?;
        }

        if let Some(finish) = &commit.finish_task {
            sqlx::query(
                "UPDATE action_tasks SET status = ?, last_error = COALESCE(?, last_error), updated_at = ?
                 WHERE id = ?",
            )
            .bind(finish.status.as_str())
            .bind(&finish.error)
            .bind(&now)
            .bind(finish.task_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        }

        if commit.cancel_open_tasks {
            sqlx::query(
                "UPDATE action_tasks SET status = 'cancelled', updated_at = ?
                 WHERE instance_id = ? AND status NOT IN ('succeeded', 'failed', 'cancelled')",
            )
            .bind(&now)
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        }

        if let Some(task) = &commit.enqueue {
            insert_task(&mut *tx, task).await?;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn list_history(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<NodeExecutionRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT sequence, node_id, node_type, entered_at, exited_at, outcome, error
               FROM node_history WHERE instance_id = ? ORDER BY sequence ASC"#,
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| HistoryRow::from_row(row).map_err(query_err)?.into_record())
            .collect()
    }

    async fn list_instances_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE status = ? ORDER BY created_at ASC, id ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        instances_from_rows(&rows)
    }

    async fn list_instances(
        &self,
        definition_id: Option<&Uuid>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = match definition_id {
            Some(def_id) => {
                sqlx::query(&format!(
                    "SELECT {INSTANCE_COLUMNS} FROM instances WHERE definition_id = ?
                     ORDER BY created_at DESC, id DESC LIMIT ?"
                ))
                .bind(def_id.to_string())
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY created_at DESC, id DESC LIMIT ?"
                ))
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_err)?;
        instances_from_rows(&rows)
    }

    async fn claim_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_until: DateTime<Utc>,
    ) -> Result<Vec<ActionTask>, RepositoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let rows = sqlx::query(&format!(
            r#"SELECT {TASK_COLUMNS} FROM action_tasks
               WHERE status IN ('pending', 'in_flight') AND next_retry_at <= ?
               ORDER BY next_retry_at ASC, id ASC LIMIT ?"#
        ))
        .bind(format_datetime(&now))
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(query_err)?;

        let mut claimed = tasks_from_rows(&rows)?;
        let until = format_datetime(&claim_until);
        let now_str = format_datetime(&now);
        for task in &mut claimed {
            sqlx::query(
                "UPDATE action_tasks SET status = 'in_flight', next_retry_at = ?, updated_at = ? WHERE id = ?",
            )
            .bind(&until)
            .bind(&now_str)
            .bind(task.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
            task.status = ActionTaskStatus::InFlight;
            task.next_retry_at = claim_until;
            task.updated_at = now;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(claimed)
    }

    async fn update_task(&self, task: &ActionTask) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE action_tasks SET
                 payload = ?, attempt = ?, max_attempts = ?, next_retry_at = ?, status = ?,
                 last_error = ?, updated_at = ?
               WHERE id = ? AND status != 'cancelled'"#,
        )
        .bind(to_json(&task.payload, "payload")?)
        .bind(i64::from(task.attempt))
        .bind(i64::from(task.max_attempts))
        .bind(format_datetime(&task.next_retry_at))
        .bind(task.status.as_str())
        .bind(&task.last_error)
        .bind(format_datetime(&task.updated_at))
        .bind(task.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        let exists = sqlx::query("SELECT 1 FROM action_tasks WHERE id = ?")
            .bind(task.id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_err)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<ActionTask>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM action_tasks WHERE id = ?"))
            .bind(id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        Ok(tasks_from_rows(&rows)?.into_iter().next())
    }

    async fn list_tasks(&self, instance_id: &Uuid) -> Result<Vec<ActionTask>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM action_tasks WHERE instance_id = ? ORDER BY created_at ASC, id ASC"
        ))
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        tasks_from_rows(&rows)
    }

    async fn get_action_result(
        &self,
        token: &str,
    ) -> Result<Option<serde_json::Value>, RepositoryError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT result FROM action_results WHERE token = ?")
                .bind(token)
                .fetch_optional(&self.pool.reader)
                .await
                .map_err(query_err)?;
        row.map(|(json,)| from_json(&json, "action result"))
            .transpose()
    }

    async fn record_action_result(
        &self,
        token: &str,
        result: &serde_json::Value,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO action_results (token, result, recorded_at) VALUES (?, ?, ?)
             ON CONFLICT(token) DO NOTHING",
        )
        .bind(token)
        .bind(to_json(result, "action result")?)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn record_event(&self, event_id: &str, scope: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO processed_events (event_id, scope, recorded_at) VALUES (?, ?, ?)
             ON CONFLICT(event_id, scope) DO NOTHING",
        )
        .bind(event_id)
        .bind(scope)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::repository::workflow::TaskFinish;
    use cadence_types::instance::{NodeOutcome, WaitReason, WaitState};
    use cadence_types::workflow::{DefinitionStatus, NodeType};
    use chrono::Duration;
    use serde_json::json;
    use std::collections::BTreeMap;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open_in(dir.path()).await.unwrap();
        std::mem::forget(dir);
        pool
    }

    fn sample_definition() -> WorkflowDefinition {
        serde_json::from_value(json!({
            "id": Uuid::now_v7(),
            "name": "lead-scoring",
            "nodes": [
                { "id": "start", "type": "trigger",
                  "config": { "type": "trigger", "event_type": "lead_created" } },
                { "id": "hot", "type": "action",
                  "config": { "type": "action", "action_type": "send_priority_email" } },
                { "id": "done", "type": "terminal", "config": { "type": "terminal" } }
            ],
            "edges": [
                { "id": "e1", "source": "start", "target": "hot" },
                { "id": "e2", "source": "hot", "target": "done" }
            ]
        }))
        .unwrap()
    }

    async fn published(repo: &SqliteWorkflowRepository) -> WorkflowDefinition {
        let mut def = sample_definition();
        def.status = DefinitionStatus::Published;
        def.published_at = Some(Utc::now());
        repo.publish_version(&def).await.unwrap();
        def
    }

    fn sample_instance(def: &WorkflowDefinition) -> WorkflowInstance {
        let now = Utc::now();
        let mut variables = BTreeMap::new();
        variables.insert("score".to_string(), json!(92));
        WorkflowInstance {
            id: Uuid::now_v7(),
            definition_id: def.id,
            definition_version: def.version,
            subject_id: "lead-1".into(),
            current_node: "hot".into(),
            variables,
            trigger_payload: json!({ "lead_id": "lead-1" }),
            status: InstanceStatus::Pending,
            wait: None,
            loop_counters: BTreeMap::new(),
            epoch: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_task(instance_id: Uuid, due: DateTime<Utc>) -> ActionTask {
        ActionTask {
            id: Uuid::now_v7(),
            instance_id,
            node_id: "hot".into(),
            action_type: "send_priority_email".into(),
            payload: json!({ "lead": "lead-1" }),
            attempt: 0,
            max_attempts: 5,
            next_retry_at: due,
            status: ActionTaskStatus::Pending,
            idempotency_token: format!("token-{instance_id}"),
            epoch: 1,
            last_error: None,
            created_at: due,
            updated_at: due,
        }
    }

    /// Parks `instance` on a new action task via `commit_step`.
    async fn park_on_task(
        repo: &SqliteWorkflowRepository,
        instance: &WorkflowInstance,
        due: DateTime<Utc>,
    ) -> (WorkflowInstance, ActionTask) {
        let task = sample_task(instance.id, due);
        let mut next = instance.clone();
        next.status = InstanceStatus::Waiting;
        next.epoch = instance.epoch + 1;
        next.wait = Some(WaitState {
            reason: WaitReason::Action {
                task_id: task.id,
                token: task.idempotency_token.clone(),
            },
            entered_at: due,
        });
        let mut commit = StepCommit::new(next.clone(), instance.epoch);
        commit.enqueue = Some(task.clone());
        repo.commit_step(&commit).await.unwrap();
        (next, task)
    }

    // -- Definitions --

    #[tokio::test]
    async fn test_draft_upsert_and_list() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let mut def = sample_definition();
        repo.save_draft(&def).await.unwrap();
        def.description = Some("updated".into());
        repo.save_draft(&def).await.unwrap();

        let loaded = repo.get_draft(&def.id).await.unwrap().unwrap();
        assert_eq!(loaded.description.as_deref(), Some("updated"));
        assert_eq!(repo.list_drafts().await.unwrap().len(), 1);
        assert!(repo.get_draft(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_versions_are_immutable() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let mut def = published(&repo).await;

        let err = repo.publish_version(&def).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        def.version = 2;
        def.description = Some("v2".into());
        repo.publish_version(&def).await.unwrap();

        let v1 = repo.get_version(&def.id, 1).await.unwrap().unwrap();
        assert!(v1.description.is_none());
        let latest = repo.latest_version(&def.id).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);

        let all = repo.list_published().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].version, 2);
    }

    // -- Instances and step commits --

    #[tokio::test]
    async fn test_instance_roundtrip() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = published(&repo).await;
        let instance = sample_instance(&def);
        repo.create_instance(&instance).await.unwrap();

        let loaded = repo.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded, instance);

        let err = repo.create_instance(&instance).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_instance_requires_published_version() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = sample_definition();
        assert!(repo.create_instance(&sample_instance(&def)).await.is_err());
    }

    #[tokio::test]
    async fn test_commit_step_applies_everything() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = published(&repo).await;
        let instance = sample_instance(&def);
        repo.create_instance(&instance).await.unwrap();

        let now = Utc::now();
        let task = sample_task(instance.id, now);
        let mut next = instance.clone();
        next.status = InstanceStatus::Waiting;
        next.epoch = 1;
        next.wait = Some(WaitState {
            reason: WaitReason::Action {
                task_id: task.id,
                token: task.idempotency_token.clone(),
            },
            entered_at: now,
        });
        let mut commit = StepCommit::new(next.clone(), 0);
        commit.records.push(NodeExecutionRecord {
            sequence: 0,
            node_id: "score".into(),
            node_type: NodeType::Condition,
            entered_at: now,
            exited_at: now,
            outcome: NodeOutcome::Branched {
                key: "hot".into(),
                edge_id: "e-hot".into(),
            },
            error: None,
        });
        commit.enqueue = Some(task.clone());
        repo.commit_step(&commit).await.unwrap();

        assert_eq!(repo.get_instance(&instance.id).await.unwrap().unwrap(), next);
        let history = repo.list_history(&instance.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, commit.records[0].outcome);
        assert_eq!(repo.get_task(&task.id).await.unwrap().unwrap(), task);
    }

    #[tokio::test]
    async fn test_commit_step_stale_epoch_writes_nothing() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = published(&repo).await;
        let instance = sample_instance(&def);
        repo.create_instance(&instance).await.unwrap();
        let (parked, _) = park_on_task(&repo, &instance, Utc::now()).await;

        // A second writer still holding epoch 0.
        let mut stale = instance.clone();
        stale.status = InstanceStatus::Completed;
        stale.epoch = 1;
        let mut commit = StepCommit::new(stale, 0);
        commit.enqueue = Some(sample_task(instance.id, Utc::now()));
        let err = repo.commit_step(&commit).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        assert_eq!(repo.get_instance(&instance.id).await.unwrap().unwrap(), parked);
        assert_eq!(repo.list_tasks(&instance.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_step_unknown_instance() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = published(&repo).await;
        let commit = StepCommit::new(sample_instance(&def), 0);
        let err = repo.commit_step(&commit).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_commit_step_finishes_and_cancels_tasks() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = published(&repo).await;
        let instance = sample_instance(&def);
        repo.create_instance(&instance).await.unwrap();
        let (parked, task) = park_on_task(&repo, &instance, Utc::now()).await;

        let mut finished = parked.clone();
        finished.status = InstanceStatus::Running;
        finished.wait = None;
        finished.epoch = 2;
        let mut commit = StepCommit::new(finished.clone(), 1);
        commit.finish_task = Some(TaskFinish {
            task_id: task.id,
            status: ActionTaskStatus::Failed,
            error: Some("smtp down".into()),
        });
        repo.commit_step(&commit).await.unwrap();
        let stored = repo.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionTaskStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("smtp down"));

        let (waiting, second) = park_on_task(&repo, &finished, Utc::now()).await;
        let mut cancelled = waiting.clone();
        cancelled.status = InstanceStatus::Cancelled;
        cancelled.wait = None;
        cancelled.epoch = waiting.epoch + 1;
        let mut commit = StepCommit::new(cancelled, waiting.epoch);
        commit.cancel_open_tasks = true;
        repo.commit_step(&commit).await.unwrap();

        let tasks = repo.list_tasks(&instance.id).await.unwrap();
        let by_id = |id| tasks.iter().find(|t| t.id == id).unwrap().status;
        assert_eq!(by_id(task.id), ActionTaskStatus::Failed);
        assert_eq!(by_id(second.id), ActionTaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_list_instances_filters_and_orders() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = published(&repo).await;
        let mut first = sample_instance(&def);
        first.created_at = Utc::now() - Duration::minutes(5);
        let mut second = sample_instance(&def);
        second.status = InstanceStatus::Waiting;
        repo.create_instance(&first).await.unwrap();
        repo.create_instance(&second).await.unwrap();

        let recent = repo.list_instances(Some(&def.id), 10).await.unwrap();
        assert_eq!(recent[0].id, second.id);
        assert_eq!(repo.list_instances(None, 1).await.unwrap().len(), 1);

        let pending = repo
            .list_instances_by_status(InstanceStatus::Pending)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first.id);
    }

    // -- Action tasks --

    #[tokio::test]
    async fn test_claim_due_tasks() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = published(&repo).await;
        let now = Utc::now();

        let due = sample_instance(&def);
        repo.create_instance(&due).await.unwrap();
        let (_, due_task) = park_on_task(&repo, &due, now - Duration::seconds(1)).await;

        let later = sample_instance(&def);
        repo.create_instance(&later).await.unwrap();
        park_on_task(&repo, &later, now + Duration::hours(1)).await;

        let claim_until = now + Duration::minutes(2);
        let claimed = repo.claim_due_tasks(now, 10, claim_until).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due_task.id);
        assert_eq!(claimed[0].status, ActionTaskStatus::InFlight);

        // Held by the claim until it expires.
        assert!(repo.claim_due_tasks(now, 10, claim_until).await.unwrap().is_empty());
        let reclaimed = repo
            .claim_due_tasks(claim_until, 10, claim_until + Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
    }

    #[tokio::test]
    async fn test_update_task() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = published(&repo).await;
        let instance = sample_instance(&def);
        repo.create_instance(&instance).await.unwrap();
        let (_, mut task) = park_on_task(&repo, &instance, Utc::now()).await;

        task.attempt = 2;
        task.status = ActionTaskStatus::AwaitingCallback;
        task.last_error = Some("timeout".into());
        assert!(repo.update_task(&task).await.unwrap());
        assert_eq!(repo.get_task(&task.id).await.unwrap().unwrap(), task);

        let missing = sample_task(instance.id, Utc::now());
        let err = repo.update_task(&missing).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_update_task_never_revives_cancelled_task() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = published(&repo).await;
        let instance = sample_instance(&def);
        repo.create_instance(&instance).await.unwrap();
        let (_, mut task) = park_on_task(&repo, &instance, Utc::now()).await;

        let mut cancelled = task.clone();
        cancelled.status = ActionTaskStatus::Cancelled;
        assert!(repo.update_task(&cancelled).await.unwrap());

        task.status = ActionTaskStatus::Succeeded;
        assert!(!repo.update_task(&task).await.unwrap());
        let stored = repo.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionTaskStatus::Cancelled);
    }

    // -- Ledgers --

    #[tokio::test]
    async fn test_action_result_first_write_wins() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        assert!(repo.get_action_result("tok").await.unwrap().is_none());
        repo.record_action_result("tok", &json!({ "id": 1 })).await.unwrap();
        repo.record_action_result("tok", &json!({ "id": 2 })).await.unwrap();
        assert_eq!(
            repo.get_action_result("tok").await.unwrap(),
            Some(json!({ "id": 1 }))
        );
    }

    #[tokio::test]
    async fn test_record_event_dedup_per_scope() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        assert!(repo.record_event("evt-1", "definition:a").await.unwrap());
        assert!(!repo.record_event("evt-1", "definition:a").await.unwrap());
        assert!(repo.record_event("evt-1", "instance:b").await.unwrap());
    }

    #[test]
    fn test_datetime_format_sorts_lexically() {
        let a = Utc::now();
        let b = a + Duration::milliseconds(1);
        assert!(format_datetime(&a) < format_datetime(&b));
        assert_eq!(parse_datetime(&format_datetime(&a)).unwrap(), a);
    }
}
