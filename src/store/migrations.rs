//! Version-tracked schema migrations for the libSQL subtask store.
//!
//! Each migration has a version number and SQL. `run_migrations()` reads the
//! highest applied version from `_migrations` and applies only newer ones.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "agent_subtasks",
        sql: r#"
            CREATE TABLE IF NOT EXISTS agent_subtasks (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                type TEXT NOT NULL,
                input_data TEXT NOT NULL DEFAULT '{}',
                config TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'pending',
                priority REAL NOT NULL DEFAULT 0,
                dependencies TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agent_subtasks_task ON agent_subtasks(task_id);
        "#,
    },
    Migration {
        version: 2,
        name: "subtask_results",
        sql: r#"
            ALTER TABLE agent_subtasks ADD COLUMN parent_id TEXT;
            ALTER TABLE agent_subtasks ADD COLUMN output_data TEXT;
            ALTER TABLE agent_subtasks ADD COLUMN error_message TEXT;
            ALTER TABLE agent_subtasks ADD COLUMN started_at TEXT;
            ALTER TABLE agent_subtasks ADD COLUMN completed_at TEXT;
            ALTER TABLE agent_subtasks ADD COLUMN duration_ms INTEGER;
            CREATE INDEX IF NOT EXISTS idx_agent_subtasks_status ON agent_subtasks(status);
        "#,
    },
];

/// Apply every pending migration.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(version = get_current_version(conn).await?, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("Failed to parse migration version: {e}"))),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
