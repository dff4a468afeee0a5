//! libSQL backend for `SubtaskStore`.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::decompose::{Subtask, SubtaskStatus, SubtaskType, SubtaskUpdate};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::SubtaskStore;

const SUBTASK_COLUMNS: &str = "id, task_id, parent_id, title, description, type, input_data, config, \
     status, priority, dependencies, created_at, output_data, error_message, started_at, completed_at, duration_ms";

/// libSQL subtask store.
///
/// Holds a single connection reused for all operations.
pub struct LibSqlSubtaskStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlSubtaskStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Subtask database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn to_json(value: &impl serde::Serialize) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn parse_json(s: Option<String>) -> serde_json::Value {
    s.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| serde_json::json!({}))
}

fn row_to_subtask(row: &libsql::Row) -> Result<Subtask, DatabaseError> {
    let text = |i: i32| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Query(format!("subtask column {i}: {e}")))
    };
    let opt = |i: i32| row.get::<String>(i).ok();

    let id = Uuid::parse_str(&text(0)?).map_err(|e| DatabaseError::Serialization(format!("subtask id: {e}")))?;
    let dependencies: Vec<Uuid> = opt(10)
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Ok(Subtask {
        id,
        task_id: text(1)?,
        parent_id: opt(2),
        title: text(3)?,
        description: opt(4).unwrap_or_default(),
        subtask_type: SubtaskType::from_label(&text(5)?),
        input_data: parse_json(opt(6)),
        config: parse_json(opt(7)),
        status: SubtaskStatus::from_label(&text(8)?),
        priority: row.get::<f64>(9).unwrap_or(0.0),
        dependencies,
        created_at: parse_datetime(&text(11)?),
        output_data: opt(12).and_then(|s| serde_json::from_str(&s).ok()),
        error_message: opt(13),
        started_at: opt(14).map(|s| parse_datetime(&s)),
        completed_at: opt(15).map(|s| parse_datetime(&s)),
        duration_ms: row.get::<i64>(16).ok(),
    })
}

#[async_trait]
impl SubtaskStore for LibSqlSubtaskStore {
    async fn save(&self, subtask: &Subtask) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let output = subtask.output_data.as_ref().map(to_json).transpose()?;

        conn.execute(
            &format!(
                "INSERT INTO agent_subtasks ({SUBTASK_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            Params::Positional(vec![
                libsql::Value::Text(subtask.id.to_string()),
                libsql::Value::Text(subtask.task_id.clone()),
                opt_text(subtask.parent_id.clone()),
                libsql::Value::Text(subtask.title.clone()),
                libsql::Value::Text(subtask.description.clone()),
                libsql::Value::Text(subtask.subtask_type.as_str().to_string()),
                libsql::Value::Text(to_json(&subtask.input_data)?),
                libsql::Value::Text(to_json(&subtask.config)?),
                libsql::Value::Text(subtask.status.as_str().to_string()),
                libsql::Value::Real(subtask.priority),
                libsql::Value::Text(to_json(&subtask.dependencies)?),
                libsql::Value::Text(subtask.created_at.to_rfc3339()),
                opt_text(output),
                opt_text(subtask.error_message.clone()),
                opt_text(subtask.started_at.map(|t| t.to_rfc3339())),
                opt_text(subtask.completed_at.map(|t| t.to_rfc3339())),
                subtask.duration_ms.map(libsql::Value::Integer).unwrap_or(libsql::Value::Null),
            ]),
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("save_subtask: {e}")))?;

        debug!(subtask_id = %subtask.id, task_id = %subtask.task_id, "Subtask saved");
        Ok(())
    }

    async fn get_subtask(&self, id: Uuid) -> Result<Option<Subtask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SUBTASK_COLUMNS} FROM agent_subtasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_subtask: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_subtask(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_subtask: {e}"))),
        }
    }

    async fn get_subtasks(&self, task_id: &str) -> Result<Vec<Subtask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SUBTASK_COLUMNS} FROM agent_subtasks WHERE task_id = ?1 \
                     ORDER BY priority ASC, created_at ASC"
                ),
                params![task_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_subtasks: {e}")))?;

        let mut subtasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_subtasks: {e}")))?
        {
            subtasks.push(row_to_subtask(&row)?);
        }
        Ok(subtasks)
    }

    async fn update_subtask(&self, id: Uuid, update: &SubtaskUpdate) -> Result<bool, DatabaseError> {
        let mut fields: Vec<&str> = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        if let Some(status) = update.status {
            fields.push("status");
            values.push(libsql::Value::Text(status.as_str().to_string()));
        }
        if let Some(input) = &update.input_data {
            fields.push("input_data");
            values.push(libsql::Value::Text(to_json(input)?));
        }
        if let Some(output) = &update.output_data {
            fields.push("output_data");
            values.push(libsql::Value::Text(to_json(output)?));
        }
        if let Some(message) = &update.error_message {
            fields.push("error_message");
            values.push(libsql::Value::Text(message.clone()));
        }
        if let Some(at) = update.started_at {
            fields.push("started_at");
            values.push(libsql::Value::Text(at.to_rfc3339()));
        }
        if let Some(at) = update.completed_at {
            fields.push("completed_at");
            values.push(libsql::Value::Text(at.to_rfc3339()));
        }
        if let Some(ms) = update.duration_ms {
            fields.push("duration_ms");
            values.push(libsql::Value::Integer(ms));
        }

        if fields.is_empty() {
            return Ok(self.get_subtask(id).await?.is_some());
        }

        let assignments: Vec<String> = fields
            .iter()
            .enumerate()
            .map(|(i, field)| format!("{field} = ?{}", i + 1))
            .collect();
        values.push(libsql::Value::Text(id.to_string()));
        let sql = format!(
            "UPDATE agent_subtasks SET {} WHERE id = ?{}",
            assignments.join(", "),
            values.len()
        );

        let count = self
            .conn()
            .execute(&sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("update_subtask: {e}")))?;

        debug!(subtask_id = %id, fields = ?fields, "Subtask updated");
        Ok(count > 0)
    }
}
