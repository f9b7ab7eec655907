//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

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
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                channel TEXT NOT NULL,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                attachments TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 5,
                response TEXT,
                error TEXT,
                spawned_parallel INTEGER NOT NULL DEFAULT 0,
                task_id TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status);
            CREATE INDEX IF NOT EXISTS idx_messages_external_id ON messages(external_id);
            CREATE INDEX IF NOT EXISTS idx_messages_claim_order
                ON messages(status, priority, created_at);

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                context TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 5,
                group_id TEXT,
                claimed_by TEXT,
                claimed_at TEXT,
                started_at TEXT,
                completed_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                result TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_claim_order
                ON tasks(status, priority, created_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_group ON tasks(group_id);

            CREATE TABLE IF NOT EXISTS task_deps (
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                depends_on TEXT NOT NULL,
                PRIMARY KEY (task_id, depends_on)
            );
            CREATE INDEX IF NOT EXISTS idx_task_deps_depends_on
                ON task_deps(depends_on);
        "#,
    },
    Migration {
        version: 2,
        name: "retry_backoff",
        sql: r#"
            ALTER TABLE tasks ADD COLUMN available_at TEXT;
            CREATE INDEX IF NOT EXISTS idx_tasks_available ON tasks(available_at);
        "#,
    },
    Migration {
        version: 3,
        name: "progress_updates",
        sql: r#"
            CREATE TABLE IF NOT EXISTS task_progress (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                note TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_progress_task
                ON task_progress(task_id, created_at);
        "#,
    },
    Migration {
        version: 4,
        name: "notification_dispatch",
        sql: r#"
            ALTER TABLE tasks ADD COLUMN notify_channel TEXT;
            ALTER TABLE tasks ADD COLUMN notification_sent INTEGER NOT NULL DEFAULT 0;
            CREATE INDEX IF NOT EXISTS idx_tasks_unnotified
                ON tasks(status, notification_sent);
        "#,
    },
    Migration {
        version: 5,
        name: "retention_archive",
        sql: r#"
            CREATE TABLE IF NOT EXISTS messages_archive (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                attachments TEXT,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                response TEXT,
                error TEXT,
                spawned_parallel INTEGER NOT NULL,
                task_id TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL,
                archived_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks_archive (
                id TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                context TEXT,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                group_id TEXT,
                claimed_by TEXT,
                claimed_at TEXT,
                started_at TEXT,
                completed_at TEXT,
                retry_count INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                result TEXT,
                error TEXT,
                available_at TEXT,
                notify_channel TEXT,
                notification_sent INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                archived_at TEXT NOT NULL
            );
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` tracking table if it doesn't exist.
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
        if migration.version <= current_version {
            continue;
        }
        conn.execute_batch(migration.sql).await.map_err(|e| {
            DatabaseError::Migration(format!(
                "Migration V{} ({}) failed: {e}",
                migration.version, migration.name
            ))
        })?;
        seed_version(conn, migration.version, migration.name).await?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied migration"
        );
    }

    Ok(())
}

/// Get the highest applied migration version (0 if none).
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("Failed to parse version: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Migration(format!(
            "Failed to read migration version: {e}"
        ))),
    }
}

/// Record a migration as applied.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
