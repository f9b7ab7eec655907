//! Unified `Database` trait — single async interface for all persistence.
//!
//! The store is the sole coordination medium between the supervisor, worker
//! processes, and producers; every component depends on this trait, never on
//! a concrete connection. All mutating status operations are guarded
//! conditional updates — a `false`/`None` return means the guard did not
//! hold (e.g. a lost claim race), which is not an error.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::model::{
    ChainStatus, ChainStep, DelegatedTask, NewMessage, ProgressUpdate, QueueStats, QueuedMessage,
    TaskRequest,
};
use crate::queue::state::TaskStatus;

/// Backend-agnostic database trait covering messages, tasks, dependencies,
/// progress, notification bookkeeping, and retention.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Messages ────────────────────────────────────────────────────

    /// Insert an inbound message, idempotent on `external_id`.
    /// Returns the id of the (new or already-present) row.
    async fn enqueue_message(&self, message: &NewMessage) -> Result<String, DatabaseError>;

    /// Get a message by internal id.
    async fn get_message(&self, id: &str) -> Result<Option<QueuedMessage>, DatabaseError>;

    /// Look up a message by its channel-native id.
    async fn get_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<QueuedMessage>, DatabaseError>;

    /// Pending messages in claim order (priority, then FIFO).
    async fn pending_messages(&self, limit: usize) -> Result<Vec<QueuedMessage>, DatabaseError>;

    /// Transition a message `pending → processing`. False if already taken.
    async fn begin_message(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Transition a message `processing → completed` with its response.
    async fn complete_message(&self, id: &str, response: &str) -> Result<bool, DatabaseError>;

    /// Transition a message `processing → failed` with an error description.
    async fn fail_message(&self, id: &str, error: &str) -> Result<bool, DatabaseError>;

    /// Record that handling this message spawned a background task.
    async fn link_spawned_task(&self, message_id: &str, task_id: Uuid)
        -> Result<(), DatabaseError>;

    /// Move terminal messages older than `keep_days` to the archive table.
    /// Returns the number of rows archived.
    async fn archive_messages(&self, keep_days: u32) -> Result<usize, DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert one task (with its dependency edges, atomically).
    async fn insert_task(&self, request: &TaskRequest) -> Result<Uuid, DatabaseError>;

    /// Atomically insert a chain of tasks sharing a fresh `group_id`.
    /// Steps reference earlier steps by index; validation happens upstream.
    async fn insert_task_chain(&self, steps: &[ChainStep]) -> Result<Vec<Uuid>, DatabaseError>;

    /// Get a task by id, dependency edges included.
    async fn get_task(&self, id: Uuid) -> Result<Option<DelegatedTask>, DatabaseError>;

    /// Up to `limit` claim-eligible tasks ordered by (priority, created_at).
    /// Eligible = pending, past any retry backoff, all dependencies completed.
    async fn claimable_tasks(&self, limit: usize) -> Result<Vec<DelegatedTask>, DatabaseError>;

    /// Atomically claim a pending, eligible task. False = lost the race
    /// (or the task stopped being eligible), which is not an error.
    async fn claim_task(&self, id: Uuid, worker_id: &str) -> Result<bool, DatabaseError>;

    /// Claim the next eligible task, if any. Used by standalone workers.
    async fn claim_next_task(
        &self,
        worker_id: &str,
    ) -> Result<Option<DelegatedTask>, DatabaseError>;

    /// Transition `claimed → running`. Guard: caller holds the claim.
    async fn start_task(&self, id: Uuid, worker_id: &str) -> Result<bool, DatabaseError>;

    /// Transition `running → completed` and store the result.
    /// Guard: caller holds the claim. Clears the claim.
    async fn complete_task(
        &self,
        id: Uuid,
        worker_id: &str,
        result: &serde_json::Value,
    ) -> Result<bool, DatabaseError>;

    /// Record a failure against the claim held under `worker_id`. Retries
    /// (→ pending, with `backoff` before the task is claimable again) while
    /// budget remains, otherwise finalizes as failed. Returns the resulting
    /// status, or None if that worker no longer holds the claim.
    ///
    /// The supervisor uses this too: for timeouts and dead workers it fails
    /// under the worker id it assigned at claim time, so a claim that was
    /// orphan-reclaimed and re-claimed elsewhere is never clobbered.
    async fn fail_task(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        backoff: Duration,
    ) -> Result<Option<TaskStatus>, DatabaseError>;

    /// Return stalled claims (claimed/running older than `claim_timeout`
    /// with no progress update since) to pending. Returns the reclaimed ids.
    async fn reclaim_orphans(&self, claim_timeout: Duration) -> Result<Vec<Uuid>, DatabaseError>;

    /// Dependents of a completed task that just became fully eligible.
    async fn unblocked_dependents(&self, completed: Uuid) -> Result<Vec<Uuid>, DatabaseError>;

    /// Fail every pending task downstream of a terminally-failed task,
    /// transitively. Returns the ids failed. Only called when the failure
    /// cascade is enabled in config.
    async fn cascade_failures(&self) -> Result<Vec<Uuid>, DatabaseError>;

    /// List tasks, optionally filtered by status, most recent first.
    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<DelegatedTask>, DatabaseError>;

    /// Aggregate counts for one chain.
    async fn get_chain_status(&self, group_id: &str) -> Result<ChainStatus, DatabaseError>;

    // ── Progress ────────────────────────────────────────────────────

    /// Append a progress note to a running task.
    async fn append_progress(&self, task_id: Uuid, note: &str) -> Result<(), DatabaseError>;

    /// Progress notes for a task, oldest first.
    async fn list_progress(&self, task_id: Uuid) -> Result<Vec<ProgressUpdate>, DatabaseError>;

    // ── Notifications ───────────────────────────────────────────────

    /// Terminal tasks with a notify channel whose notice is undelivered.
    async fn unnotified_tasks(&self, limit: usize) -> Result<Vec<DelegatedTask>, DatabaseError>;

    /// Mark a task's completion notice as delivered.
    async fn mark_notified(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Operations ──────────────────────────────────────────────────

    /// Move terminal, notified tasks older than `keep_days` to the archive
    /// table, unless a live dependent still references them.
    async fn archive_tasks(&self, keep_days: u32) -> Result<usize, DatabaseError>;

    /// Operational snapshot: queue depth and recent terminals.
    async fn queue_stats(&self) -> Result<QueueStats, DatabaseError>;
}
