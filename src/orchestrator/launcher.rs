//! Worker process launching — the process-management seam.
//!
//! The supervisor never touches `tokio::process` directly; it launches
//! through `WorkerLauncher` and monitors through `WorkerHandle`, so tests can
//! substitute in-process fakes. The production `ProcessLauncher` spawns the
//! worker binary detached from any interactive session: workers outlive the
//! supervisor if it exits.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::SpawnError;
use crate::queue::model::DelegatedTask;

/// Handle to a launched worker process.
#[async_trait]
pub trait WorkerHandle: Send {
    /// Non-blocking exit check. Returns the exit code once the process has
    /// exited, None while it is still running.
    fn try_wait(&mut self) -> Result<Option<i32>, SpawnError>;

    /// Forcibly terminate the worker. Used only on deadline expiry.
    async fn terminate(&mut self) -> Result<(), SpawnError>;
}

/// Launches worker processes.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        task: &DelegatedTask,
        worker_id: &str,
    ) -> Result<Box<dyn WorkerHandle>, SpawnError>;
}

/// Spawns the `offload-worker` binary as an independent OS process.
///
/// Task id, worker id, and the database path travel via environment
/// variables. `kill_on_drop` stays off: a worker must survive supervisor
/// exit and finish by writing its status to the store.
pub struct ProcessLauncher {
    worker_bin: PathBuf,
    db_path: PathBuf,
}

impl ProcessLauncher {
    pub fn new(worker_bin: PathBuf, db_path: PathBuf) -> Self {
        Self {
            worker_bin,
            db_path,
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        task: &DelegatedTask,
        worker_id: &str,
    ) -> Result<Box<dyn WorkerHandle>, SpawnError> {
        let child = tokio::process::Command::new(&self.worker_bin)
            .env("OFFLOAD_DB_PATH", &self.db_path)
            .env("OFFLOAD_TASK_ID", task.id.to_string())
            .env("OFFLOAD_WORKER_ID", worker_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()?;

        info!(
            task_id = %task.id,
            worker_id = worker_id,
            pid = child.id().unwrap_or(0),
            "Worker process launched"
        );
        Ok(Box::new(ProcessHandle { child }))
    }
}

struct ProcessHandle {
    child: tokio::process::Child,
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    fn try_wait(&mut self) -> Result<Option<i32>, SpawnError> {
        match self.child.try_wait() {
            Ok(Some(status)) => Ok(Some(status.code().unwrap_or(-1))),
            Ok(None) => Ok(None),
            Err(e) => Err(SpawnError::Io(e)),
        }
    }

    async fn terminate(&mut self) -> Result<(), SpawnError> {
        let pid = self.child.id().unwrap_or(0);
        warn!(pid, "Terminating worker process");
        self.child.kill().await.map_err(SpawnError::Io)
    }
}
