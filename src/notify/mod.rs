//! Notification dispatch — best-effort, idempotent completion notices.
//!
//! Delivery is decoupled from task status: the `notification_sent` flag flips
//! only on success, so a failed delivery is retried by a later sweep without
//! ever re-running the task. At-least-once, by design of the flag.

pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::NotifyError;
use crate::queue::model::DelegatedTask;
use crate::store::Database;

pub use webhook::WebhookNotifier;

/// Delivers a completion notice for a terminal task.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, task: &DelegatedTask) -> Result<(), NotifyError>;
}

/// Notifier that only logs. Used when no delivery channel is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, task: &DelegatedTask) -> Result<(), NotifyError> {
        tracing::info!(
            task_id = %task.id,
            status = %task.status,
            "Task reached terminal status (log-only notification)"
        );
        Ok(())
    }
}

/// Attempt delivery for up to `limit` unnotified terminal tasks.
///
/// Failures are logged and left for the next sweep. Returns the number of
/// notices delivered.
pub async fn deliver_pending(
    store: &Arc<dyn Database>,
    notifier: &Arc<dyn Notifier>,
    limit: usize,
) -> usize {
    let tasks = match store.unnotified_tasks(limit).await {
        Ok(tasks) => tasks,
        Err(e) => {
            warn!(error = %e, "Failed to list unnotified tasks");
            return 0;
        }
    };

    let mut delivered = 0;
    for task in tasks {
        match notifier.notify(&task).await {
            Ok(()) => match store.mark_notified(task.id).await {
                Ok(_) => {
                    debug!(task_id = %task.id, "Completion notice delivered");
                    delivered += 1;
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Delivered but failed to mark notified");
                }
            },
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Notification delivery failed, will retry");
            }
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::model::TaskRequest;
    use crate::store::LibSqlBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Notifier that counts deliveries and can be told to fail.
    struct CountingNotifier {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _task: &DelegatedTask) -> Result<(), NotifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(NotifyError::Http("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    async fn terminal_task_with_channel(store: &Arc<dyn Database>) -> Uuid {
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
        id
    }

    #[tokio::test]
    async fn delivers_once_per_terminal_task() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        terminal_task_with_channel(&store).await;

        let notifier = Arc::new(CountingNotifier {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let as_trait: Arc<dyn Notifier> = notifier.clone();

        assert_eq!(deliver_pending(&store, &as_trait, 10).await, 1);
        // Second sweep: flag is set, nothing to deliver
        assert_eq!(deliver_pending(&store, &as_trait, 10).await, 0);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_delivery_is_retried_next_sweep() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let id = terminal_task_with_channel(&store).await;

        let failing = Arc::new(CountingNotifier {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let as_trait: Arc<dyn Notifier> = failing.clone();
        assert_eq!(deliver_pending(&store, &as_trait, 10).await, 0);

        // Task status untouched by the delivery failure
        let task = store.get_task(id).await.unwrap().unwrap();
        assert!(!task.notification_sent);
        assert_eq!(task.status, crate::queue::state::TaskStatus::Completed);

        // A healthy notifier picks it up on the next sweep
        let healthy = Arc::new(CountingNotifier {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let as_trait: Arc<dyn Notifier> = healthy.clone();
        assert_eq!(deliver_pending(&store, &as_trait, 10).await, 1);
    }
}
