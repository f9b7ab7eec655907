//! libSQL backend — async `Database` trait implementation.
//!
//! Every status mutation is a single conditional UPDATE whose WHERE clause
//! encodes the transition guard; the affected-row count tells the caller
//! whether it won. Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::model::{
    ChainStatus, ChainStep, DelegatedTask, NewMessage, ProgressUpdate, QueueStats, QueuedMessage,
    TaskRequest,
};
use crate::queue::state::{MessageStatus, TaskStatus};
use crate::store::migrations;

/// Retry budget applied when a request doesn't specify one.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
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

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    /// Re-run the migration set (a no-op when up to date).
    pub async fn rerun_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn begin(&self) -> Result<(), DatabaseError> {
        self.conn
            .execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("begin: {e}")))?;
        Ok(())
    }

    async fn commit(&self) -> Result<(), DatabaseError> {
        self.conn
            .execute("COMMIT", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("commit: {e}")))?;
        Ok(())
    }

    async fn rollback(&self) {
        if let Err(e) = self.conn.execute("ROLLBACK", ()).await {
            warn!("rollback failed: {e}");
        }
    }

    /// Insert one task row plus its dependency edges. Caller owns the
    /// transaction boundary.
    async fn insert_task_row(
        &self,
        id: Uuid,
        description: &str,
        context: Option<&serde_json::Value>,
        priority: i32,
        max_retries: Option<i32>,
        notify_channel: Option<&str>,
        group_id: Option<&str>,
        depends_on: &[Uuid],
    ) -> Result<(), DatabaseError> {
        let now = now_str();
        let context_str = match context {
            Some(v) => Some(
                serde_json::to_string(v)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tasks (id, description, context, status, priority, group_id,
                retry_count, max_retries, notify_channel, notification_sent,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, 0, ?6, ?7, 0, ?8, ?8)",
            params![
                id.to_string(),
                description,
                opt_text_owned(context_str),
                priority as i64,
                opt_text(group_id),
                max_retries.unwrap_or(DEFAULT_MAX_RETRIES) as i64,
                opt_text(notify_channel),
                now,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;

        for dep in depends_on {
            conn.execute(
                "INSERT OR IGNORE INTO task_deps (task_id, depends_on) VALUES (?1, ?2)",
                params![id.to_string(), dep.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task_dep: {e}")))?;
        }
        Ok(())
    }

    /// Load dependency edges for each task in place.
    async fn fill_depends_on(&self, tasks: &mut [DelegatedTask]) -> Result<(), DatabaseError> {
        let conn = self.conn();
        for task in tasks.iter_mut() {
            let mut rows = conn
                .query(
                    "SELECT depends_on FROM task_deps WHERE task_id = ?1 ORDER BY depends_on",
                    params![task.id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("fill_depends_on: {e}")))?;
            let mut deps = Vec::new();
            while let Ok(Some(row)) = rows.next().await {
                let dep: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("dep parse: {e}")))?;
                if let Ok(id) = Uuid::parse_str(&dep) {
                    deps.push(id);
                }
            }
            task.depends_on = deps;
        }
        Ok(())
    }

    async fn task_status(&self, id: Uuid) -> Result<Option<TaskStatus>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status FROM tasks WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("task_status: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let s: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("status parse: {e}")))?;
                Ok(Some(TaskStatus::parse(&s)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("task_status: {e}"))),
        }
    }

    /// Run a COUNT(*) query with an optional single text bind.
    async fn count(&self, sql: &str, arg: Option<&str>) -> Result<usize, DatabaseError> {
        let conn = self.conn();
        let mut rows = match arg {
            Some(arg) => conn.query(sql, params![arg]).await,
            None => conn.query(sql, ()).await,
        }
        .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let n: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count parse: {e}")))?;
                Ok(n.max(0) as usize)
            }
            _ => Ok(0),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn parse_optional_json(s: Option<String>) -> Option<serde_json::Value> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

const MESSAGE_COLUMNS: &str = "id, external_id, channel, sender, content, attachments, status, \
     priority, response, error, spawned_parallel, task_id, created_at, started_at, completed_at, \
     updated_at";

fn row_to_message(row: &libsql::Row) -> Result<QueuedMessage, libsql::Error> {
    let attachments: Option<String> = row.get(5).ok();
    let status_str: String = row.get(6)?;
    let priority: i64 = row.get(7)?;
    let spawned: i64 = row.get(10)?;
    let task_id: Option<String> = row.get(11).ok();
    let created_str: String = row.get(12)?;
    let started_str: Option<String> = row.get(13).ok();
    let completed_str: Option<String> = row.get(14).ok();
    let updated_str: String = row.get(15)?;

    Ok(QueuedMessage {
        id: row.get(0)?,
        external_id: row.get(1)?,
        channel: row.get(2)?,
        sender: row.get(3)?,
        content: row.get(4)?,
        attachments: parse_optional_json(attachments),
        status: MessageStatus::parse(&status_str),
        priority: priority as i32,
        response: row.get(8).ok(),
        error: row.get(9).ok(),
        spawned_parallel: spawned != 0,
        task_id: task_id.and_then(|s| Uuid::parse_str(&s).ok()),
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(&started_str),
        completed_at: parse_optional_datetime(&completed_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const TASK_COLUMNS: &str = "id, description, context, status, priority, group_id, claimed_by, \
     claimed_at, started_at, completed_at, available_at, retry_count, max_retries, result, error, \
     notify_channel, notification_sent, created_at, updated_at";

fn row_to_task(row: &libsql::Row) -> Result<DelegatedTask, libsql::Error> {
    let id_str: String = row.get(0)?;
    let context: Option<String> = row.get(2).ok();
    let status_str: String = row.get(3)?;
    let priority: i64 = row.get(4)?;
    let claimed_str: Option<String> = row.get(7).ok();
    let started_str: Option<String> = row.get(8).ok();
    let completed_str: Option<String> = row.get(9).ok();
    let available_str: Option<String> = row.get(10).ok();
    let retry_count: i64 = row.get(11)?;
    let max_retries: i64 = row.get(12)?;
    let result: Option<String> = row.get(13).ok();
    let notified: i64 = row.get(16)?;
    let created_str: String = row.get(17)?;
    let updated_str: String = row.get(18)?;

    Ok(DelegatedTask {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        description: row.get(1)?,
        context: parse_optional_json(context),
        status: TaskStatus::parse(&status_str),
        priority: priority as i32,
        group_id: row.get(5).ok(),
        depends_on: Vec::new(), // filled by fill_depends_on
        claimed_by: row.get(6).ok(),
        claimed_at: parse_optional_datetime(&claimed_str),
        started_at: parse_optional_datetime(&started_str),
        completed_at: parse_optional_datetime(&completed_str),
        available_at: parse_optional_datetime(&available_str),
        retry_count: retry_count as i32,
        max_retries: max_retries as i32,
        result: parse_optional_json(result),
        error: row.get(14).ok(),
        notify_channel: row.get(15).ok(),
        notification_sent: notified != 0,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Claim-eligibility predicate, shared by the claim update and the
/// claimable scan. `?1` is the current time. A dangling `depends_on` id
/// keeps the dependent blocked rather than silently eligible.
const ELIGIBLE: &str = "status = 'pending'
       AND claimed_by IS NULL
       AND (available_at IS NULL OR available_at <= ?1)
       AND NOT EXISTS (
           SELECT 1 FROM task_deps d
           LEFT JOIN tasks up ON up.id = d.depends_on
           WHERE d.task_id = tasks.id
             AND (up.id IS NULL OR up.status != 'completed')
       )";

/// Shared failure transition: retry while budget remains, else finalize.
/// `?1` now, `?2` task id, `?3` next available_at, `?4` error text.
const FAIL_SET: &str = "status = CASE WHEN retry_count < max_retries THEN 'pending' ELSE 'failed' END,
         retry_count = CASE WHEN retry_count < max_retries THEN retry_count + 1 ELSE retry_count END,
         available_at = CASE WHEN retry_count < max_retries THEN ?3 ELSE NULL END,
         completed_at = CASE WHEN retry_count < max_retries THEN NULL ELSE ?1 END,
         started_at = CASE WHEN retry_count < max_retries THEN NULL ELSE started_at END,
         claimed_by = NULL,
         claimed_at = NULL,
         error = ?4,
         updated_at = ?1";

#[async_trait]
impl crate::store::Database for LibSqlBackend {
    // ── Messages ────────────────────────────────────────────────────

    async fn enqueue_message(&self, message: &NewMessage) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = now_str();
        let attachments_str = match &message.attachments {
            Some(v) => Some(
                serde_json::to_string(v)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        let conn = self.conn();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO messages (id, external_id, channel, sender, content,
                    attachments, status, priority, spawned_parallel, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, 0, ?8, ?8)",
                params![
                    id.clone(),
                    message.external_id.as_str(),
                    message.channel.as_str(),
                    message.sender.as_str(),
                    message.content.as_str(),
                    opt_text_owned(attachments_str),
                    message.priority as i64,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue_message: {e}")))?;

        if inserted == 1 {
            debug!(id = %id, external_id = %message.external_id, "Message inserted");
            return Ok(id);
        }

        // Re-delivery: hand back the existing row's id.
        let mut rows = conn
            .query(
                "SELECT id FROM messages WHERE external_id = ?1",
                params![message.external_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue_message lookup: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let existing: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("id parse: {e}")))?;
                debug!(id = %existing, external_id = %message.external_id, "Duplicate enqueue ignored");
                Ok(existing)
            }
            _ => Err(DatabaseError::Constraint(format!(
                "message with external_id {} vanished during idempotent insert",
                message.external_id
            ))),
        }
    }

    async fn get_message(&self, id: &str) -> Result<Option<QueuedMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_message(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_message: {e}"))),
        }
    }

    async fn get_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<QueuedMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE external_id = ?1"),
                params![external_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message_by_external_id: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_message(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "get_message_by_external_id: {e}"
            ))),
        }
    }

    async fn pending_messages(&self, limit: usize) -> Result<Vec<QueuedMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE status = 'pending'
                     ORDER BY priority ASC, created_at ASC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pending_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("Skipping message row: {e}"),
            }
        }
        Ok(messages)
    }

    async fn begin_message(&self, id: &str) -> Result<bool, DatabaseError> {
        let now = now_str();
        let n = self
            .conn()
            .execute(
                "UPDATE messages SET status = 'processing', started_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("begin_message: {e}")))?;
        Ok(n == 1)
    }

    async fn complete_message(&self, id: &str, response: &str) -> Result<bool, DatabaseError> {
        let now = now_str();
        let n = self
            .conn()
            .execute(
                "UPDATE messages SET status = 'completed', response = ?1,
                    completed_at = ?2, updated_at = ?2
                 WHERE id = ?3 AND status = 'processing'",
                params![response, now, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_message: {e}")))?;
        Ok(n == 1)
    }

    async fn fail_message(&self, id: &str, error: &str) -> Result<bool, DatabaseError> {
        let now = now_str();
        let n = self
            .conn()
            .execute(
                "UPDATE messages SET status = 'failed', error = ?1,
                    completed_at = ?2, updated_at = ?2
                 WHERE id = ?3 AND status = 'processing'",
                params![error, now, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_message: {e}")))?;
        Ok(n == 1)
    }

    async fn link_spawned_task(
        &self,
        message_id: &str,
        task_id: Uuid,
    ) -> Result<(), DatabaseError> {
        let now = now_str();
        self.conn()
            .execute(
                "UPDATE messages SET spawned_parallel = 1, task_id = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![task_id.to_string(), now, message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("link_spawned_task: {e}")))?;
        Ok(())
    }

    async fn archive_messages(&self, keep_days: u32) -> Result<usize, DatabaseError> {
        let now = now_str();
        let cutoff = (Utc::now() - chrono::Duration::days(keep_days as i64)).to_rfc3339();

        self.begin().await?;
        let archived = match self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO messages_archive
                 SELECT id, external_id, channel, sender, content, attachments, status,
                        priority, response, error, spawned_parallel, task_id, created_at,
                        started_at, completed_at, updated_at, ?1
                 FROM messages
                 WHERE status IN ('completed', 'failed')
                   AND COALESCE(completed_at, updated_at) <= ?2",
                params![now, cutoff],
            )
            .await
        {
            Ok(n) => n,
            Err(e) => {
                self.rollback().await;
                return Err(DatabaseError::Query(format!("archive_messages: {e}")));
            }
        };
        if let Err(e) = self
            .conn()
            .execute(
                "DELETE FROM messages WHERE id IN (SELECT id FROM messages_archive)",
                (),
            )
            .await
        {
            self.rollback().await;
            return Err(DatabaseError::Query(format!("archive_messages delete: {e}")));
        }
        self.commit().await?;
        Ok(archived as usize)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, request: &TaskRequest) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        self.begin().await?;
        if let Err(e) = self
            .insert_task_row(
                id,
                &request.description,
                request.context.as_ref(),
                request.priority,
                request.max_retries,
                request.notify_channel.as_deref(),
                request.group_id.as_deref(),
                &request.depends_on,
            )
            .await
        {
            self.rollback().await;
            return Err(e);
        }
        self.commit().await?;
        Ok(id)
    }

    async fn insert_task_chain(&self, steps: &[ChainStep]) -> Result<Vec<Uuid>, DatabaseError> {
        let group_id = Uuid::new_v4().to_string();
        let ids: Vec<Uuid> = steps.iter().map(|_| Uuid::new_v4()).collect();

        self.begin().await?;
        for (step, id) in steps.iter().zip(&ids) {
            let depends_on: Vec<Uuid> = step
                .depends_on_indices
                .iter()
                .filter_map(|&i| ids.get(i).copied())
                .collect();
            if let Err(e) = self
                .insert_task_row(
                    *id,
                    &step.description,
                    step.context.as_ref(),
                    step.priority,
                    step.max_retries,
                    step.notify_channel.as_deref(),
                    Some(&group_id),
                    &depends_on,
                )
                .await
            {
                self.rollback().await;
                return Err(e);
            }
        }
        self.commit().await?;
        info!(group_id = %group_id, count = ids.len(), "Task chain inserted");
        Ok(ids)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<DelegatedTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let task = row_to_task(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                let mut tasks = [task];
                self.fill_depends_on(&mut tasks).await?;
                let [task] = tasks;
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn claimable_tasks(&self, limit: usize) -> Result<Vec<DelegatedTask>, DatabaseError> {
        let now = now_str();
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE {ELIGIBLE}
                     ORDER BY priority ASC, created_at ASC LIMIT ?2"
                ),
                params![now, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claimable_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Skipping task row: {e}"),
            }
        }
        self.fill_depends_on(&mut tasks).await?;
        Ok(tasks)
    }

    async fn claim_task(&self, id: Uuid, worker_id: &str) -> Result<bool, DatabaseError> {
        let now = now_str();
        let n = self
            .conn()
            .execute(
                &format!(
                    "UPDATE tasks SET status = 'claimed', claimed_by = ?2,
                        claimed_at = ?1, updated_at = ?1
                     WHERE id = ?3 AND {ELIGIBLE}"
                ),
                params![now, worker_id, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_task: {e}")))?;
        if n == 1 {
            debug!(task_id = %id, worker_id = worker_id, "Task claimed");
        }
        Ok(n == 1)
    }

    async fn claim_next_task(
        &self,
        worker_id: &str,
    ) -> Result<Option<DelegatedTask>, DatabaseError> {
        // Small batch: races against other claimants are expected, just
        // move down the list.
        let candidates = self.claimable_tasks(8).await?;
        for candidate in candidates {
            if self.claim_task(candidate.id, worker_id).await? {
                return self.get_task(candidate.id).await;
            }
        }
        Ok(None)
    }

    async fn start_task(&self, id: Uuid, worker_id: &str) -> Result<bool, DatabaseError> {
        let now = now_str();
        let n = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'running', started_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND claimed_by = ?3 AND status = 'claimed'",
                params![now, id.to_string(), worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("start_task: {e}")))?;
        Ok(n == 1)
    }

    async fn complete_task(
        &self,
        id: Uuid,
        worker_id: &str,
        result: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let now = now_str();
        let result_str =
            serde_json::to_string(result).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let n = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'completed', result = ?1, completed_at = ?2,
                    updated_at = ?2, claimed_by = NULL, claimed_at = NULL
                 WHERE id = ?3 AND claimed_by = ?4 AND status = 'running'",
                params![result_str, now, id.to_string(), worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_task: {e}")))?;
        if n == 1 {
            info!(task_id = %id, "Task completed");
        }
        Ok(n == 1)
    }

    async fn fail_task(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        backoff: Duration,
    ) -> Result<Option<TaskStatus>, DatabaseError> {
        let now = now_str();
        let available_at =
            (Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default()).to_rfc3339();
        let n = self
            .conn()
            .execute(
                &format!(
                    "UPDATE tasks SET {FAIL_SET}
                     WHERE id = ?2 AND claimed_by = ?5 AND status IN ('claimed', 'running')"
                ),
                params![now, id.to_string(), available_at, error, worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_task: {e}")))?;
        if n == 0 {
            return Ok(None);
        }
        self.task_status(id).await
    }

    async fn reclaim_orphans(&self, claim_timeout: Duration) -> Result<Vec<Uuid>, DatabaseError> {
        let cutoff = (Utc::now()
            - chrono::Duration::from_std(claim_timeout).unwrap_or_default())
        .to_rfc3339();
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT id FROM tasks
                 WHERE status IN ('claimed', 'running')
                   AND COALESCE(started_at, claimed_at) <= ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM task_progress p
                       WHERE p.task_id = tasks.id AND p.created_at > ?1
                   )",
                params![cutoff.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reclaim_orphans: {e}")))?;

        let mut candidates = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("id parse: {e}")))?;
            if let Ok(id) = Uuid::parse_str(&id) {
                candidates.push(id);
            }
        }

        let now = now_str();
        let mut reclaimed = Vec::new();
        for id in candidates {
            let n = conn
                .execute(
                    "UPDATE tasks SET status = 'pending', claimed_by = NULL,
                        claimed_at = NULL, started_at = NULL, updated_at = ?1
                     WHERE id = ?2 AND status IN ('claimed', 'running')",
                    params![now.clone(), id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("reclaim_orphans update: {e}")))?;
            if n == 1 {
                warn!(task_id = %id, "Reclaimed orphaned claim");
                reclaimed.push(id);
            }
        }
        Ok(reclaimed)
    }

    async fn unblocked_dependents(&self, completed: Uuid) -> Result<Vec<Uuid>, DatabaseError> {
        let now = now_str();
        let mut rows = self
            .conn()
            .query(
                "SELECT d.task_id FROM task_deps d
                 JOIN tasks t ON t.id = d.task_id
                 WHERE d.depends_on = ?1
                   AND t.status = 'pending'
                   AND (t.available_at IS NULL OR t.available_at <= ?2)
                   AND NOT EXISTS (
                       SELECT 1 FROM task_deps d2
                       LEFT JOIN tasks up ON up.id = d2.depends_on
                       WHERE d2.task_id = d.task_id
                         AND (up.id IS NULL OR up.status != 'completed')
                   )",
                params![completed.to_string(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("unblocked_dependents: {e}")))?;

        let mut unblocked = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("id parse: {e}")))?;
            if let Ok(id) = Uuid::parse_str(&id) {
                unblocked.push(id);
            }
        }
        Ok(unblocked)
    }

    async fn cascade_failures(&self) -> Result<Vec<Uuid>, DatabaseError> {
        let conn = self.conn();
        let mut all_failed = Vec::new();

        // Repeat until fixpoint so multi-level chains fail through.
        loop {
            let mut rows = conn
                .query(
                    "SELECT t.id, MIN(up.id) FROM tasks t
                     JOIN task_deps d ON d.task_id = t.id
                     JOIN tasks up ON up.id = d.depends_on
                     WHERE t.status = 'pending' AND up.status = 'failed'
                     GROUP BY t.id",
                    (),
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("cascade_failures: {e}")))?;

            let mut round = Vec::new();
            while let Ok(Some(row)) = rows.next().await {
                let id: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("id parse: {e}")))?;
                let upstream: String = row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("id parse: {e}")))?;
                if let Ok(id) = Uuid::parse_str(&id) {
                    round.push((id, upstream));
                }
            }
            if round.is_empty() {
                break;
            }

            let now = now_str();
            for (id, upstream) in round {
                let n = conn
                    .execute(
                        "UPDATE tasks SET status = 'failed', error = ?1,
                            completed_at = ?2, updated_at = ?2
                         WHERE id = ?3 AND status = 'pending'",
                        params![
                            format!("upstream task {upstream} failed permanently"),
                            now.clone(),
                            id.to_string(),
                        ],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("cascade_failures update: {e}")))?;
                if n == 1 {
                    warn!(task_id = %id, upstream = %upstream, "Cascaded upstream failure");
                    all_failed.push(id);
                }
            }
        }
        Ok(all_failed)
    }

    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<DelegatedTask>, DatabaseError> {
        let conn = self.conn();
        let mut rows = match status {
            Some(status) => conn
                .query(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1
                         ORDER BY created_at DESC LIMIT ?2"
                    ),
                    params![status.as_str(), limit as i64],
                )
                .await,
            None => conn
                .query(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC LIMIT ?1"
                    ),
                    params![limit as i64],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Skipping task row: {e}"),
            }
        }
        self.fill_depends_on(&mut tasks).await?;
        Ok(tasks)
    }

    async fn get_chain_status(&self, group_id: &str) -> Result<ChainStatus, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
                 FROM tasks WHERE group_id = ?1",
                params![group_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_chain_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let total: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count parse: {e}")))?;
                let completed: i64 = row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("count parse: {e}")))?;
                let failed: i64 = row
                    .get(2)
                    .map_err(|e| DatabaseError::Query(format!("count parse: {e}")))?;
                Ok(ChainStatus {
                    group_id: group_id.to_string(),
                    total: total as usize,
                    completed: completed as usize,
                    failed: failed as usize,
                    pending: (total - completed - failed).max(0) as usize,
                })
            }
            _ => Ok(ChainStatus {
                group_id: group_id.to_string(),
                total: 0,
                completed: 0,
                failed: 0,
                pending: 0,
            }),
        }
    }

    // ── Progress ────────────────────────────────────────────────────

    async fn append_progress(&self, task_id: Uuid, note: &str) -> Result<(), DatabaseError> {
        let now = now_str();
        self.conn()
            .execute(
                "INSERT INTO task_progress (id, task_id, note, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    Uuid::new_v4().to_string(),
                    task_id.to_string(),
                    note,
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_progress: {e}")))?;
        Ok(())
    }

    async fn list_progress(&self, task_id: Uuid) -> Result<Vec<ProgressUpdate>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, task_id, note, created_at FROM task_progress
                 WHERE task_id = ?1 ORDER BY created_at ASC",
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_progress: {e}")))?;

        let mut updates = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let task_str: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            let created_str: String = row
                .get(3)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            updates.push(ProgressUpdate {
                id: row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
                task_id: Uuid::parse_str(&task_str).unwrap_or_else(|_| Uuid::nil()),
                note: row
                    .get(2)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(updates)
    }

    // ── Notifications ───────────────────────────────────────────────

    async fn unnotified_tasks(&self, limit: usize) -> Result<Vec<DelegatedTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE status IN ('completed', 'failed')
                       AND notification_sent = 0
                       AND notify_channel IS NOT NULL
                     ORDER BY completed_at ASC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("unnotified_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Skipping task row: {e}"),
            }
        }
        Ok(tasks)
    }

    async fn mark_notified(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let now = now_str();
        let n = self
            .conn()
            .execute(
                "UPDATE tasks SET notification_sent = 1, updated_at = ?1
                 WHERE id = ?2 AND notification_sent = 0",
                params![now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_notified: {e}")))?;
        Ok(n == 1)
    }

    // ── Operations ──────────────────────────────────────────────────

    async fn archive_tasks(&self, keep_days: u32) -> Result<usize, DatabaseError> {
        let now = now_str();
        let cutoff = (Utc::now() - chrono::Duration::days(keep_days as i64)).to_rfc3339();

        self.begin().await?;
        let archived = match self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO tasks_archive
                 SELECT id, description, context, status, priority, group_id, claimed_by,
                        claimed_at, started_at, completed_at, retry_count, max_retries,
                        result, error, available_at, notify_channel, notification_sent,
                        created_at, updated_at, ?1
                 FROM tasks
                 WHERE status IN ('completed', 'failed')
                   AND COALESCE(completed_at, updated_at) <= ?2
                   AND (notify_channel IS NULL OR notification_sent = 1)
                   AND NOT EXISTS (
                       SELECT 1 FROM task_deps d
                       JOIN tasks t2 ON t2.id = d.task_id
                       WHERE d.depends_on = tasks.id
                         AND t2.status NOT IN ('completed', 'failed')
                   )",
                params![now, cutoff],
            )
            .await
        {
            Ok(n) => n,
            Err(e) => {
                self.rollback().await;
                return Err(DatabaseError::Query(format!("archive_tasks: {e}")));
            }
        };
        if let Err(e) = self
            .conn()
            .execute(
                "DELETE FROM tasks WHERE id IN (SELECT id FROM tasks_archive)",
                (),
            )
            .await
        {
            self.rollback().await;
            return Err(DatabaseError::Query(format!("archive_tasks delete: {e}")));
        }
        self.commit().await?;
        if archived > 0 {
            info!(count = archived, "Archived terminal tasks");
        }
        Ok(archived as usize)
    }

    async fn queue_stats(&self) -> Result<QueueStats, DatabaseError> {
        let now = now_str();
        let hour_ago = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();

        let messages_pending = self
            .count("SELECT COUNT(*) FROM messages WHERE status = 'pending'", None)
            .await?;
        let messages_processing = self
            .count(
                "SELECT COUNT(*) FROM messages WHERE status = 'processing'",
                None,
            )
            .await?;
        let tasks_pending = self
            .count("SELECT COUNT(*) FROM tasks WHERE status = 'pending'", None)
            .await?;
        let tasks_blocked = self
            .count(
                "SELECT COUNT(*) FROM tasks WHERE status = 'pending' AND (
                     (available_at IS NOT NULL AND available_at > ?1)
                     OR EXISTS (
                         SELECT 1 FROM task_deps d
                         LEFT JOIN tasks up ON up.id = d.depends_on
                         WHERE d.task_id = tasks.id
                           AND (up.id IS NULL OR up.status != 'completed')
                     ))",
                Some(&now),
            )
            .await?;
        let tasks_claimed = self
            .count("SELECT COUNT(*) FROM tasks WHERE status = 'claimed'", None)
            .await?;
        let tasks_running = self
            .count("SELECT COUNT(*) FROM tasks WHERE status = 'running'", None)
            .await?;
        let tasks_completed_last_hour = self
            .count(
                "SELECT COUNT(*) FROM tasks WHERE status = 'completed' AND completed_at > ?1",
                Some(&hour_ago),
            )
            .await?;
        let tasks_failed_last_hour = self
            .count(
                "SELECT COUNT(*) FROM tasks WHERE status = 'failed' AND completed_at > ?1",
                Some(&hour_ago),
            )
            .await?;

        Ok(QueueStats {
            messages_pending,
            messages_processing,
            tasks_pending,
            tasks_blocked,
            tasks_claimed,
            tasks_running,
            tasks_completed_last_hour,
            tasks_failed_last_hour,
        })
    }
}
