//! Task execution seam.
//!
//! The queue never interprets a task's `description`/`context` — that is the
//! executor's job. `ShellExecutor` is the built-in: it runs the command named
//! in the task context and captures its output. Tests plug in stubs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::TaskError;
use crate::queue::model::DelegatedTask;
use crate::store::Database;

/// Receives progress notes from a running executor.
///
/// Reporting is fire-and-forget: a sink must never block or fail the task.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, note: &str);
}

/// Progress sink backed by the shared store. Notes written here also renew
/// the task's orphan-reclaim exemption.
pub struct StoreProgress {
    store: Arc<dyn Database>,
    task_id: Uuid,
}

impl StoreProgress {
    pub fn new(store: Arc<dyn Database>, task_id: Uuid) -> Self {
        Self { store, task_id }
    }
}

#[async_trait]
impl ProgressSink for StoreProgress {
    async fn report(&self, note: &str) {
        if let Err(e) = self.store.append_progress(self.task_id, note).await {
            warn!(task_id = %self.task_id, error = %e, "Failed to append progress note");
        }
    }
}

/// Executes one task to produce a result payload.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        task: &DelegatedTask,
        progress: &dyn ProgressSink,
    ) -> Result<serde_json::Value, TaskError>;
}

/// Runs the shell command named in the task context.
///
/// Expects `context` to carry `{"command": "<shell command>"}`. The captured
/// stdout/stderr and exit code become the result payload; a non-zero exit is
/// an execution failure (and therefore retried like any other).
pub struct ShellExecutor;

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(
        &self,
        task: &DelegatedTask,
        progress: &dyn ProgressSink,
    ) -> Result<serde_json::Value, TaskError> {
        let command = task
            .context
            .as_ref()
            .and_then(|c| c.get("command"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| TaskError::ExecutionFailed {
                reason: "task context has no 'command' to execute".to_string(),
            })?;

        debug!(task_id = %task.id, command, "Executing shell command");
        progress.report(&format!("running: {command}")).await;

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| TaskError::ExecutionFailed {
                reason: format!("failed to spawn shell: {e}"),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            return Err(TaskError::ExecutionFailed {
                reason: format!("command exited with status {code}: {stderr}"),
            });
        }

        Ok(serde_json::json!({
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": code,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::model::TaskRequest;
    use crate::store::LibSqlBackend;

    struct NullSink;

    #[async_trait]
    impl ProgressSink for NullSink {
        async fn report(&self, _note: &str) {}
    }

    async fn task_with_context(context: Option<serde_json::Value>) -> DelegatedTask {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut request = TaskRequest::new("run something");
        request.context = context;
        let id = db.insert_task(&request).await.unwrap();
        db.get_task(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn shell_executor_captures_stdout() {
        let task =
            task_with_context(Some(serde_json::json!({"command": "echo delegation works"}))).await;
        let result = ShellExecutor.execute(&task, &NullSink).await.unwrap();
        assert_eq!(result["exit_code"], 0);
        assert!(result["stdout"].as_str().unwrap().contains("delegation works"));
    }

    #[tokio::test]
    async fn shell_executor_fails_on_nonzero_exit() {
        let task = task_with_context(Some(serde_json::json!({"command": "exit 3"}))).await;
        let err = ShellExecutor.execute(&task, &NullSink).await.unwrap_err();
        assert!(matches!(err, TaskError::ExecutionFailed { reason } if reason.contains("3")));
    }

    #[tokio::test]
    async fn shell_executor_rejects_missing_command() {
        let task = task_with_context(None).await;
        let err = ShellExecutor.execute(&task, &NullSink).await.unwrap_err();
        assert!(matches!(err, TaskError::ExecutionFailed { .. }));
    }

    #[tokio::test]
    async fn store_progress_writes_rows() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let id = db.insert_task(&TaskRequest::new("t")).await.unwrap();
        let store: Arc<dyn Database> = db.clone();
        let sink = StoreProgress::new(store, id);
        sink.report("halfway").await;

        let updates = db.list_progress(id).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].note, "halfway");
    }
}
