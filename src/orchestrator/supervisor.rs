//! Supervisor — the long-lived orchestrator poll loop.
//!
//! Each cycle, in order: reclaim orphaned claims, cascade failures (when
//! enabled), drain inbound messages, claim and launch up to the concurrency
//! cap, poll the active worker set for exits and deadline overruns, report
//! newly-unblocked dependents, deliver notifications, and occasionally run
//! retention archival.
//!
//! Restart safety: reclaim runs first thing in every cycle, so a supervisor
//! that crashed mid-flight recovers its in-flight work on the next start.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::notify::{self, Notifier};
use crate::orchestrator::launcher::{WorkerHandle, WorkerLauncher};
use crate::orchestrator::pump::{self, MessageHandler};
use crate::queue::state::TaskStatus;
use crate::store::Database;

/// A launched worker being monitored.
struct ActiveWorker {
    task_id: Uuid,
    worker_id: String,
    handle: Box<dyn WorkerHandle>,
    deadline: Instant,
}

pub struct Supervisor {
    config: Config,
    store: Arc<dyn Database>,
    launcher: Arc<dyn WorkerLauncher>,
    notifier: Arc<dyn Notifier>,
    handler: Option<Arc<dyn MessageHandler>>,
    active: Vec<ActiveWorker>,
    last_archive: Option<Instant>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        store: Arc<dyn Database>,
        launcher: Arc<dyn WorkerLauncher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            store,
            launcher,
            notifier,
            handler: None,
            active: Vec::new(),
            last_archive: None,
        }
    }

    /// Builder: attach a message handler to drain the interactive queue.
    pub fn with_message_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Number of workers currently being monitored.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Run the poll loop until the process is killed.
    pub async fn run(mut self) {
        info!(
            poll_interval = ?self.config.poll_interval,
            max_workers = self.config.max_workers,
            "Supervisor started"
        );

        let mut tick = tokio::time::interval(self.config.poll_interval);
        // First tick fires immediately: orphan reclaim happens before any
        // new work is taken on after a restart.
        loop {
            tick.tick().await;
            self.run_cycle().await;
        }
    }

    /// One poll cycle. Public so integration tests can drive the supervisor
    /// deterministically without the interval timer.
    pub async fn run_cycle(&mut self) {
        match self.store.reclaim_orphans(self.config.claim_timeout).await {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                warn!(count = reclaimed.len(), "Reclaimed orphaned claims");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Orphan reclaim failed"),
        }

        if self.config.cascade_failures {
            match self.store.cascade_failures().await {
                Ok(failed) if !failed.is_empty() => {
                    warn!(count = failed.len(), "Cascaded upstream failures");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failure cascade failed"),
            }
        }

        if let Some(handler) = self.handler.clone() {
            let taken = pump::drain_messages(&self.store, &handler, self.config.message_batch).await;
            if taken > 0 {
                debug!(count = taken, "Drained inbound messages");
            }
        }

        self.launch_claimable().await;
        let completed = self.poll_active().await;

        for task_id in completed {
            match self.store.unblocked_dependents(task_id).await {
                Ok(unblocked) => {
                    for dependent in unblocked {
                        info!(task_id = %dependent, upstream = %task_id, "Task became claimable");
                    }
                }
                Err(e) => warn!(task_id = %task_id, error = %e, "Dependent lookup failed"),
            }
        }

        notify::deliver_pending(&self.store, &self.notifier, self.config.notify_batch).await;

        self.maybe_archive().await;
    }

    /// Claim up to the remaining capacity and launch a worker per claim.
    /// Lost claim races are skipped silently.
    async fn launch_claimable(&mut self) {
        let capacity = self.config.max_workers.saturating_sub(self.active.len());
        if capacity == 0 {
            return;
        }

        let claimable = match self.store.claimable_tasks(capacity).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Failed to fetch claimable tasks");
                return;
            }
        };

        for task in claimable {
            let worker_id = format!("worker-{}", Uuid::new_v4().simple());
            match self.store.claim_task(task.id, &worker_id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(task_id = %task.id, "Lost claim race, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Claim attempt failed");
                    continue;
                }
            }

            match self.launcher.launch(&task, &worker_id).await {
                Ok(handle) => {
                    self.active.push(ActiveWorker {
                        task_id: task.id,
                        worker_id,
                        handle,
                        deadline: Instant::now() + self.config.task_timeout,
                    });
                }
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "Worker launch failed");
                    self.fail_under_claim(
                        task.id,
                        &worker_id,
                        &format!("failed to launch worker: {e}"),
                        task.retry_count,
                    )
                    .await;
                }
            }
        }
    }

    /// Poll every active worker; returns the ids that completed this cycle.
    async fn poll_active(&mut self) -> Vec<Uuid> {
        let mut kept = Vec::new();
        let mut completed = Vec::new();

        for mut worker in std::mem::take(&mut self.active) {
            match worker.handle.try_wait() {
                Ok(Some(exit_code)) => {
                    if let Some(id) = self.reap_exited(&worker, exit_code).await {
                        completed.push(id);
                    }
                }
                Ok(None) => {
                    if Instant::now() >= worker.deadline {
                        self.kill_overrunning(&mut worker).await;
                    } else {
                        kept.push(worker);
                    }
                }
                Err(e) => {
                    // Handle is gone; orphan reclaim will recover the task
                    // once the claim goes stale.
                    warn!(
                        task_id = %worker.task_id,
                        worker_id = %worker.worker_id,
                        error = %e,
                        "Lost worker handle"
                    );
                }
            }
        }

        self.active = kept;
        completed
    }

    /// A worker process exited: read the terminal status it wrote. A worker
    /// that died without writing one gets a synthesized failure (same retry
    /// policy as any other) instead of waiting out the claim timeout.
    async fn reap_exited(&self, worker: &ActiveWorker, exit_code: i32) -> Option<Uuid> {
        match self.store.get_task(worker.task_id).await {
            Ok(Some(task)) if task.status.is_terminal() => {
                debug!(
                    task_id = %task.id,
                    status = %task.status,
                    exit_code,
                    "Worker finished"
                );
                (task.status == TaskStatus::Completed).then_some(task.id)
            }
            Ok(Some(task)) => {
                warn!(
                    task_id = %task.id,
                    exit_code,
                    "Worker exited without reporting a terminal status"
                );
                self.fail_under_claim(
                    task.id,
                    &worker.worker_id,
                    &format!("worker exited (code {exit_code}) without reporting a terminal status"),
                    task.retry_count,
                )
                .await;
                None
            }
            Ok(None) => {
                warn!(task_id = %worker.task_id, "Task vanished while its worker ran");
                None
            }
            Err(e) => {
                warn!(task_id = %worker.task_id, error = %e, "Status read failed on reap");
                None
            }
        }
    }

    /// A worker blew its wall-clock deadline: kill it and fail the task with
    /// a timeout error, subject to the normal retry policy.
    async fn kill_overrunning(&self, worker: &mut ActiveWorker) {
        warn!(
            task_id = %worker.task_id,
            worker_id = %worker.worker_id,
            timeout = ?self.config.task_timeout,
            "Worker deadline elapsed, terminating"
        );
        if let Err(e) = worker.handle.terminate().await {
            warn!(task_id = %worker.task_id, error = %e, "Worker termination failed");
        }

        let retry_count = match self.store.get_task(worker.task_id).await {
            Ok(Some(task)) => task.retry_count,
            _ => 0,
        };
        self.fail_under_claim(
            worker.task_id,
            &worker.worker_id,
            &format!("timed out after {:?}", self.config.task_timeout),
            retry_count,
        )
        .await;
    }

    /// Record a supervisor-synthesized failure under the claim it assigned at
    /// launch. If the claim has since been orphan-reclaimed (and possibly
    /// re-claimed elsewhere), the guard misses and the task is left alone.
    async fn fail_under_claim(&self, task_id: Uuid, worker_id: &str, error: &str, retry_count: i32) {
        let backoff = self.config.backoff_for(retry_count);
        match self.store.fail_task(task_id, worker_id, error, backoff).await {
            Ok(Some(status)) => {
                debug!(task_id = %task_id, status = %status, "Failure recorded");
            }
            Ok(None) => {
                debug!(task_id = %task_id, "Claim moved on before failure could be recorded");
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to record failure");
            }
        }
    }

    async fn maybe_archive(&mut self) {
        let due = self
            .last_archive
            .map(|at| at.elapsed() >= self.config.archive_interval)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_archive = Some(Instant::now());

        match self.store.archive_messages(self.config.retention_days).await {
            Ok(n) if n > 0 => info!(count = n, "Archived messages past retention"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Message archival failed"),
        }
        match self.store.archive_tasks(self.config.retention_days).await {
            Ok(n) if n > 0 => info!(count = n, "Archived tasks past retention"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Task archival failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{NotifyError, SpawnError};
    use crate::notify::LogNotifier;
    use crate::queue::model::{DelegatedTask, TaskRequest};
    use crate::queue::state::TaskStatus;
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Handle that never exits until terminated.
    struct HangingHandle {
        terminated: bool,
    }

    #[async_trait]
    impl WorkerHandle for HangingHandle {
        fn try_wait(&mut self) -> Result<Option<i32>, SpawnError> {
            Ok(self.terminated.then_some(-9))
        }

        async fn terminate(&mut self) -> Result<(), SpawnError> {
            self.terminated = true;
            Ok(())
        }
    }

    /// Launcher whose workers hang forever (until killed).
    struct HangingLauncher {
        launches: AtomicUsize,
    }

    impl HangingLauncher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                launches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl WorkerLauncher for HangingLauncher {
        async fn launch(
            &self,
            _task: &DelegatedTask,
            _worker_id: &str,
        ) -> Result<Box<dyn WorkerHandle>, SpawnError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(HangingHandle { terminated: false }))
        }
    }

    /// Launcher whose workers exit instantly without touching the store.
    struct VanishingLauncher;

    struct ExitedHandle;

    #[async_trait]
    impl WorkerHandle for ExitedHandle {
        fn try_wait(&mut self) -> Result<Option<i32>, SpawnError> {
            Ok(Some(1))
        }

        async fn terminate(&mut self) -> Result<(), SpawnError> {
            Ok(())
        }
    }

    #[async_trait]
    impl WorkerLauncher for VanishingLauncher {
        async fn launch(
            &self,
            _task: &DelegatedTask,
            _worker_id: &str,
        ) -> Result<Box<dyn WorkerHandle>, SpawnError> {
            Ok(Box::new(ExitedHandle))
        }
    }

    struct CountingNotifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _task: &DelegatedTask) -> Result<(), NotifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_config() -> Config {
        Config {
            max_workers: 2,
            task_timeout: Duration::from_secs(3600),
            retry_backoff_base: Duration::ZERO,
            ..Default::default()
        }
    }

    async fn memory_store() -> Arc<dyn Database> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    #[tokio::test]
    async fn concurrency_cap_limits_launches() {
        let store = memory_store().await;
        for i in 0..3 {
            store
                .insert_task(&TaskRequest::new(format!("t{i}")))
                .await
                .unwrap();
        }

        let launcher = HangingLauncher::new();
        let mut supervisor = Supervisor::new(
            test_config(),
            Arc::clone(&store),
            launcher.clone(),
            Arc::new(LogNotifier),
        );

        supervisor.run_cycle().await;
        assert_eq!(supervisor.active_count(), 2);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);

        // Cap still full next cycle: nothing new launches
        supervisor.run_cycle().await;
        assert_eq!(supervisor.active_count(), 2);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);

        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.tasks_claimed, 2);
        assert_eq!(stats.tasks_pending, 1);
    }

    #[tokio::test]
    async fn deadline_overrun_kills_and_fails_with_timeout() {
        let store = memory_store().await;
        let id = store
            .insert_task(&TaskRequest::new("slow").with_max_retries(0))
            .await
            .unwrap();

        let config = Config {
            task_timeout: Duration::ZERO,
            ..test_config()
        };
        let mut supervisor = Supervisor::new(
            config,
            Arc::clone(&store),
            HangingLauncher::new(),
            Arc::new(LogNotifier),
        );

        supervisor.run_cycle().await; // claims + launches
        supervisor.run_cycle().await; // deadline already passed: kill + fail
        assert_eq!(supervisor.active_count(), 0);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn timeout_failure_respects_retry_budget() {
        let store = memory_store().await;
        let id = store
            .insert_task(&TaskRequest::new("slow").with_max_retries(1))
            .await
            .unwrap();

        let config = Config {
            task_timeout: Duration::ZERO,
            ..test_config()
        };
        let mut supervisor = Supervisor::new(
            config,
            Arc::clone(&store),
            HangingLauncher::new(),
            Arc::new(LogNotifier),
        );

        // Launch and deadline-kill happen within one cycle (zero timeout)
        supervisor.run_cycle().await;

        // First timeout consumed a retry: back to pending
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
    }

    #[tokio::test]
    async fn worker_death_without_status_is_failed() {
        let store = memory_store().await;
        let id = store
            .insert_task(&TaskRequest::new("t").with_max_retries(0))
            .await
            .unwrap();

        let mut supervisor = Supervisor::new(
            test_config(),
            Arc::clone(&store),
            Arc::new(VanishingLauncher),
            Arc::new(LogNotifier),
        );

        supervisor.run_cycle().await; // launch
        supervisor.run_cycle().await; // reap: exited, no terminal status
        assert_eq!(supervisor.active_count(), 0);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("without reporting"));
    }

    #[tokio::test]
    async fn notifies_terminal_tasks_once() {
        let store = memory_store().await;
        let id = store
            .insert_task(&TaskRequest::new("t").with_notify_channel("https://hooks.example/n"))
            .await
            .unwrap();
        assert!(store.claim_task(id, "w1").await.unwrap());
        assert!(store.start_task(id, "w1").await.unwrap());
        assert!(store
            .complete_task(id, "w1", &serde_json::json!({}))
            .await
            .unwrap());

        let notifier = Arc::new(CountingNotifier {
            calls: AtomicUsize::new(0),
        });
        let mut supervisor = Supervisor::new(
            test_config(),
            Arc::clone(&store),
            HangingLauncher::new(),
            notifier.clone(),
        );

        supervisor.run_cycle().await;
        supervisor.run_cycle().await;
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cascade_runs_only_when_enabled() {
        let store = memory_store().await;
        let a = store
            .insert_task(&TaskRequest::new("a").with_max_retries(0))
            .await
            .unwrap();
        let b = store
            .insert_task(&TaskRequest::new("b").depends_on(a))
            .await
            .unwrap();
        assert!(store.claim_task(a, "w1").await.unwrap());
        assert!(store.start_task(a, "w1").await.unwrap());
        store
            .fail_task(a, "w1", "dead", Duration::ZERO)
            .await
            .unwrap();

        // Cascade off: dependent stays blocked
        let mut supervisor = Supervisor::new(
            test_config(),
            Arc::clone(&store),
            HangingLauncher::new(),
            Arc::new(LogNotifier),
        );
        supervisor.run_cycle().await;
        assert_eq!(
            store.get_task(b).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );

        // Cascade on: dependent fails
        let config = Config {
            cascade_failures: true,
            ..test_config()
        };
        let mut supervisor = Supervisor::new(
            config,
            Arc::clone(&store),
            HangingLauncher::new(),
            Arc::new(LogNotifier),
        );
        supervisor.run_cycle().await;
        assert_eq!(
            store.get_task(b).await.unwrap().unwrap().status,
            TaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn startup_cycle_reclaims_orphans_before_launching() {
        let store = memory_store().await;
        let id = store.insert_task(&TaskRequest::new("orphaned")).await.unwrap();
        // A previous supervisor claimed this and crashed
        assert!(store.claim_task(id, "dead-supervisor-worker").await.unwrap());

        let config = Config {
            claim_timeout: Duration::ZERO,
            ..test_config()
        };
        let launcher = HangingLauncher::new();
        let mut supervisor =
            Supervisor::new(config, Arc::clone(&store), launcher.clone(), Arc::new(LogNotifier));

        supervisor.run_cycle().await;

        // Reclaimed and relaunched under a fresh claim in the same cycle
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Claimed);
        assert_ne!(task.claimed_by.as_deref(), Some("dead-supervisor-worker"));
    }
}
