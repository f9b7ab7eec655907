//! End-to-end lifecycle tests: supervisor cycles driving real worker runners
//! in-process against a shared store, with stubbed execution and delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use offload::config::Config;
use offload::error::{NotifyError, SpawnError, TaskError};
use offload::notify::Notifier;
use offload::orchestrator::{
    DelegatingHandler, MessageHandler, Supervisor, WorkerHandle, WorkerLauncher,
};
use offload::queue::{
    ChainStep, DelegatedTask, MessageStatus, NewMessage, Producer, TaskRequest, TaskStatus,
};
use offload::store::{Database, LibSqlBackend};
use offload::worker::{ProgressSink, TaskExecutor, WorkerRunner};

/// Executor stub: echoes the description, or fails a set number of times.
struct StubExecutor {
    failures_remaining: AtomicUsize,
}

impl StubExecutor {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            failures_remaining: AtomicUsize::new(0),
        })
    }

    fn failing(times: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_remaining: AtomicUsize::new(times),
        })
    }
}

#[async_trait]
impl TaskExecutor for StubExecutor {
    async fn execute(
        &self,
        task: &DelegatedTask,
        _progress: &dyn ProgressSink,
    ) -> Result<serde_json::Value, TaskError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(TaskError::ExecutionFailed {
                reason: "injected failure".to_string(),
            });
        }
        Ok(serde_json::json!({"echo": task.description}))
    }
}

/// Launcher that runs a real `WorkerRunner` on an in-process tokio task.
/// The worker still coordinates with the supervisor only through the store.
struct InlineLauncher {
    store: Arc<dyn Database>,
    executor: Arc<dyn TaskExecutor>,
    config: Config,
}

struct InlineHandle {
    join: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl WorkerHandle for InlineHandle {
    fn try_wait(&mut self) -> Result<Option<i32>, SpawnError> {
        Ok(self.join.is_finished().then_some(0))
    }

    async fn terminate(&mut self) -> Result<(), SpawnError> {
        self.join.abort();
        Ok(())
    }
}

#[async_trait]
impl WorkerLauncher for InlineLauncher {
    async fn launch(
        &self,
        task: &DelegatedTask,
        worker_id: &str,
    ) -> Result<Box<dyn WorkerHandle>, SpawnError> {
        let runner = WorkerRunner::new(
            Arc::clone(&self.store),
            Arc::clone(&self.executor),
            worker_id,
            self.config.clone(),
        );
        let task_id = task.id;
        let join = tokio::spawn(async move {
            let _ = runner.run_task(task_id).await;
        });
        Ok(Box::new(InlineHandle { join }))
    }
}

struct RecordingNotifier {
    calls: AtomicUsize,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, _task: &DelegatedTask) -> Result<(), NotifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn fast_config() -> Config {
    Config {
        max_workers: 4,
        task_timeout: Duration::from_secs(30),
        claim_timeout: Duration::from_secs(30),
        retry_backoff_base: Duration::ZERO,
        retry_backoff_max: Duration::ZERO,
        ..Default::default()
    }
}

struct Harness {
    store: Arc<dyn Database>,
    supervisor: Supervisor,
    notifier: Arc<RecordingNotifier>,
}

async fn harness(executor: Arc<dyn TaskExecutor>, config: Config) -> Harness {
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let launcher = Arc::new(InlineLauncher {
        store: Arc::clone(&store),
        executor,
        config: config.clone(),
    });
    let notifier = Arc::new(RecordingNotifier {
        calls: AtomicUsize::new(0),
    });
    let handler: Arc<dyn MessageHandler> = Arc::new(DelegatingHandler::new(
        Producer::new(Arc::clone(&store)),
        config.default_max_retries,
    ));
    let notifier_for_supervisor: Arc<dyn Notifier> = notifier.clone();
    let supervisor = Supervisor::new(config, Arc::clone(&store), launcher, notifier_for_supervisor)
        .with_message_handler(handler);

    Harness {
        store,
        supervisor,
        notifier,
    }
}

/// Drive supervisor cycles until `done` or the cycle budget runs out.
async fn drive<F>(harness: &mut Harness, cycles: usize, mut done: F)
where
    F: AsyncFnMut(&Arc<dyn Database>) -> bool,
{
    for _ in 0..cycles {
        harness.supervisor.run_cycle().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        if done(&harness.store).await {
            return;
        }
    }
    panic!("condition not reached within {cycles} supervisor cycles");
}

#[tokio::test]
async fn message_is_delegated_executed_and_answered() {
    let mut harness = harness(StubExecutor::succeeding(), fast_config()).await;
    let producer = Producer::new(Arc::clone(&harness.store));

    let message_id = producer
        .enqueue_message(NewMessage::new("ext-1", "chat", "alice", "file my expenses"))
        .await
        .unwrap();

    drive(&mut harness, 30, async |store: &Arc<dyn Database>| {
        match store.get_message(&message_id).await.unwrap().unwrap().task_id {
            Some(task_id) => {
                let task = store.get_task(task_id).await.unwrap().unwrap();
                task.status == TaskStatus::Completed
            }
            None => false,
        }
    })
    .await;

    let message = harness.store.get_message(&message_id).await.unwrap().unwrap();
    assert_eq!(message.status, MessageStatus::Completed);
    assert!(message.spawned_parallel);
    assert!(message.response.unwrap().starts_with("queued as task"));

    let task = harness
        .store
        .get_task(message.task_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.result, Some(serde_json::json!({"echo": "file my expenses"})));
}

#[tokio::test]
async fn chain_completes_in_dependency_order() {
    let mut harness = harness(StubExecutor::succeeding(), fast_config()).await;
    let producer = Producer::new(Arc::clone(&harness.store));

    let ids = producer
        .create_task_chain(vec![
            ChainStep::new("collect sources"),
            ChainStep::new("draft summary").after(0),
            ChainStep::new("send summary").after(1),
        ])
        .await
        .unwrap();
    let group = harness
        .store
        .get_task(ids[0])
        .await
        .unwrap()
        .unwrap()
        .group_id
        .unwrap();

    let group_for_done = group.clone();
    drive(&mut harness, 40, async move |store: &Arc<dyn Database>| {
        let status = store.get_chain_status(&group_for_done).await.unwrap();
        status.completed == 3
    })
    .await;

    let status = producer.get_chain_status(&group).await.unwrap();
    assert_eq!(status.total, 3);
    assert_eq!(status.completed, 3);
    assert_eq!(status.failed, 0);
    assert_eq!(status.pending, 0);

    // Dependency order is visible in the completion timestamps
    let first = harness.store.get_task(ids[0]).await.unwrap().unwrap();
    let second = harness.store.get_task(ids[1]).await.unwrap().unwrap();
    let third = harness.store.get_task(ids[2]).await.unwrap().unwrap();
    assert!(first.completed_at.unwrap() <= second.started_at.unwrap());
    assert!(second.completed_at.unwrap() <= third.started_at.unwrap());
}

#[tokio::test]
async fn transient_failures_retry_to_success() {
    let mut harness = harness(StubExecutor::failing(2), fast_config()).await;
    let producer = Producer::new(Arc::clone(&harness.store));

    let id = producer
        .delegate_task(TaskRequest::new("flaky fetch").with_max_retries(3))
        .await
        .unwrap();

    drive(&mut harness, 40, async move |store: &Arc<dyn Database>| {
        store.get_task(id).await.unwrap().unwrap().status == TaskStatus::Completed
    })
    .await;

    let task = harness.store.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.retry_count, 2, "two injected failures consumed retries");
    assert!(task.result.is_some());
}

#[tokio::test]
async fn retry_exhaustion_is_terminal() {
    let mut harness = harness(StubExecutor::failing(usize::MAX), fast_config()).await;
    let producer = Producer::new(Arc::clone(&harness.store));

    let id = producer
        .delegate_task(TaskRequest::new("doomed").with_max_retries(2))
        .await
        .unwrap();

    drive(&mut harness, 40, async move |store: &Arc<dyn Database>| {
        store.get_task(id).await.unwrap().unwrap().status == TaskStatus::Failed
    })
    .await;

    let task = harness.store.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.retry_count, 2);
    assert!(task.error.unwrap().contains("injected failure"));

    // Terminal failed never reappears as claimable
    harness.supervisor.run_cycle().await;
    let eligible = harness.store.claimable_tasks(10).await.unwrap();
    assert!(eligible.iter().all(|t| t.id != id));
}

#[tokio::test]
async fn orphaned_claim_is_recovered_and_rerun() {
    let config = Config {
        claim_timeout: Duration::ZERO,
        ..fast_config()
    };
    let mut harness = harness(StubExecutor::succeeding(), config).await;
    let producer = Producer::new(Arc::clone(&harness.store));

    let id = producer
        .delegate_task(TaskRequest::new("abandoned"))
        .await
        .unwrap();
    // A worker claimed this and was killed before writing any status
    assert!(harness.store.claim_task(id, "killed-worker").await.unwrap());
    assert!(harness.store.start_task(id, "killed-worker").await.unwrap());

    drive(&mut harness, 30, async move |store: &Arc<dyn Database>| {
        store.get_task(id).await.unwrap().unwrap().status == TaskStatus::Completed
    })
    .await;

    let task = harness.store.get_task(id).await.unwrap().unwrap();
    assert!(task.result.is_some(), "re-run after reclaim produced a result");
}

#[tokio::test]
async fn completion_notice_is_delivered_exactly_once_per_task() {
    let mut harness = harness(StubExecutor::succeeding(), fast_config()).await;
    let producer = Producer::new(Arc::clone(&harness.store));

    let id = producer
        .delegate_task(
            TaskRequest::new("noisy")
                .with_notify_channel("https://hooks.example/done"),
        )
        .await
        .unwrap();

    drive(&mut harness, 30, async move |store: &Arc<dyn Database>| {
        store
            .get_task(id)
            .await
            .unwrap()
            .unwrap()
            .notification_sent
    })
    .await;

    // Extra cycles must not redeliver
    harness.supervisor.run_cycle().await;
    harness.supervisor.run_cycle().await;
    assert_eq!(harness.notifier.calls.load(Ordering::SeqCst), 1);
}
