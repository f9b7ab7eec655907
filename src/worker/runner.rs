//! Worker runner — executes claimed tasks and writes terminal status.
//!
//! A runner is deliberately ignorant of who launched it: it coordinates with
//! the supervisor purely through the store. `run_task` handles the
//! supervisor-spawned path (the claim already held under this worker's id);
//! `run_loop` is the standalone mode that claims its own work.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, TaskError};
use crate::queue::state::TaskStatus;
use crate::store::Database;
use crate::worker::executor::{StoreProgress, TaskExecutor};

pub struct WorkerRunner {
    store: Arc<dyn Database>,
    executor: Arc<dyn TaskExecutor>,
    worker_id: String,
    config: Config,
}

impl WorkerRunner {
    pub fn new(
        store: Arc<dyn Database>,
        executor: Arc<dyn TaskExecutor>,
        worker_id: impl Into<String>,
        config: Config,
    ) -> Self {
        Self {
            store,
            executor,
            worker_id: worker_id.into(),
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Execute one task to a terminal status and return that status.
    ///
    /// Takes the claim if the task is still pending (standalone path), or
    /// verifies it already holds it (supervisor pre-claimed under this
    /// worker's id). Anything else is a refusal, not an error on the task.
    pub async fn run_task(&self, task_id: Uuid) -> Result<TaskStatus> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(TaskError::NotFound { id: task_id })?;

        match task.status {
            TaskStatus::Pending => {
                if !self.store.claim_task(task_id, &self.worker_id).await? {
                    return Err(TaskError::NotClaimable { id: task_id }.into());
                }
            }
            TaskStatus::Claimed if task.claimed_by.as_deref() == Some(&self.worker_id) => {}
            TaskStatus::Claimed | TaskStatus::Running => {
                return Err(TaskError::NotClaimHolder {
                    id: task_id,
                    worker_id: self.worker_id.clone(),
                }
                .into());
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                return Err(TaskError::NotClaimable { id: task_id }.into());
            }
        }

        if !self.store.start_task(task_id, &self.worker_id).await? {
            // Lost the claim between verify and start (orphan reclaim won)
            return Err(TaskError::NotClaimHolder {
                id: task_id,
                worker_id: self.worker_id.clone(),
            }
            .into());
        }

        // Refresh: the claim/start transitions stamped timestamps
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(TaskError::NotFound { id: task_id })?;

        info!(task_id = %task_id, worker_id = %self.worker_id, "Executing task");
        let progress = StoreProgress::new(Arc::clone(&self.store), task_id);

        match self.executor.execute(&task, &progress).await {
            Ok(result) => {
                if self
                    .store
                    .complete_task(task_id, &self.worker_id, &result)
                    .await?
                {
                    Ok(TaskStatus::Completed)
                } else {
                    // The claim was reclaimed mid-execution; the result is
                    // lost and the task will be re-run elsewhere.
                    warn!(task_id = %task_id, "Completion rejected: claim no longer held");
                    Err(TaskError::NotClaimHolder {
                        id: task_id,
                        worker_id: self.worker_id.clone(),
                    }
                    .into())
                }
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Task execution failed");
                let backoff = self.config.backoff_for(task.retry_count);
                match self
                    .store
                    .fail_task(task_id, &self.worker_id, &e.to_string(), backoff)
                    .await?
                {
                    Some(status) => Ok(status),
                    None => Err(TaskError::NotClaimHolder {
                        id: task_id,
                        worker_id: self.worker_id.clone(),
                    }
                    .into()),
                }
            }
        }
    }

    /// Standalone mode: claim and execute tasks until the process is killed.
    pub async fn run_loop(&self) -> Result<()> {
        info!(worker_id = %self.worker_id, "Worker loop started");
        loop {
            match self.store.claim_next_task(&self.worker_id).await? {
                Some(task) => {
                    if let Err(e) = self.run_task(task.id).await {
                        // The task row already carries the failure; this is
                        // only the worker's own bookkeeping going wrong.
                        warn!(task_id = %task.id, error = %e, "Run attempt aborted");
                    }
                }
                None => {
                    tokio::time::sleep(self.poll_interval()).await;
                }
            }
        }
    }

    fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::model::{DelegatedTask, TaskRequest};
    use crate::store::LibSqlBackend;
    use crate::worker::executor::ProgressSink;
    use async_trait::async_trait;

    /// Executor that succeeds or fails on demand.
    struct StubExecutor {
        fail: bool,
    }

    #[async_trait]
    impl TaskExecutor for StubExecutor {
        async fn execute(
            &self,
            task: &DelegatedTask,
            progress: &dyn ProgressSink,
        ) -> std::result::Result<serde_json::Value, TaskError> {
            progress.report("working").await;
            if self.fail {
                Err(TaskError::ExecutionFailed {
                    reason: "stub failure".to_string(),
                })
            } else {
                Ok(serde_json::json!({"echo": task.description}))
            }
        }
    }

    async fn setup(fail: bool) -> (Arc<LibSqlBackend>, WorkerRunner) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let store: Arc<dyn Database> = db.clone();
        let config = Config {
            retry_backoff_base: Duration::ZERO,
            ..Default::default()
        };
        let runner = WorkerRunner::new(store, Arc::new(StubExecutor { fail }), "w1", config);
        (db, runner)
    }

    #[tokio::test]
    async fn runs_pending_task_to_completion() {
        let (db, runner) = setup(false).await;
        let id = db.insert_task(&TaskRequest::new("echo me")).await.unwrap();

        let status = runner.run_task(id).await.unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let task = db.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.result, Some(serde_json::json!({"echo": "echo me"})));
        assert!(task.completed_at.is_some());

        let progress = db.list_progress(id).await.unwrap();
        assert_eq!(progress.len(), 1);
    }

    #[tokio::test]
    async fn runs_preclaimed_task() {
        let (db, runner) = setup(false).await;
        let id = db.insert_task(&TaskRequest::new("t")).await.unwrap();
        // The supervisor claims under the worker's id before launching it
        assert!(db.claim_task(id, "w1").await.unwrap());

        let status = runner.run_task(id).await.unwrap();
        assert_eq!(status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn refuses_task_claimed_by_another_worker() {
        let (db, runner) = setup(false).await;
        let id = db.insert_task(&TaskRequest::new("t")).await.unwrap();
        assert!(db.claim_task(id, "someone-else").await.unwrap());

        let err = runner.run_task(id).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Task(TaskError::NotClaimHolder { .. })
        ));
        // Untouched: still claimed by the original holder
        let task = db.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.claimed_by.as_deref(), Some("someone-else"));
    }

    #[tokio::test]
    async fn failure_writes_error_and_retries() {
        let (db, runner) = setup(true).await;
        let id = db
            .insert_task(&TaskRequest::new("doomed").with_max_retries(1))
            .await
            .unwrap();

        let status = runner.run_task(id).await.unwrap();
        assert_eq!(status, TaskStatus::Pending, "first failure retries");

        let status = runner.run_task(id).await.unwrap();
        assert_eq!(status, TaskStatus::Failed, "budget exhausted");

        let task = db.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.retry_count, 1);
        assert!(task.error.unwrap().contains("stub failure"));
    }

    #[tokio::test]
    async fn missing_task_is_an_error() {
        let (_db, runner) = setup(false).await;
        let err = runner.run_task(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Task(TaskError::NotFound { .. })
        ));
    }
}
