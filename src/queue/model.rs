//! Queue data model — messages, tasks, progress, and aggregate views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::state::{MessageStatus, TaskStatus};

/// One inbound unit of interactive work, persisted for durability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Internal ID.
    pub id: String,
    /// Channel-native message ID; unique, the idempotency key for enqueue.
    pub external_id: String,
    /// Origin channel name.
    pub channel: String,
    /// Origin user/sender identifier.
    pub sender: String,
    /// Raw message content.
    pub content: String,
    /// Optional attachment references (opaque JSON array).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<serde_json::Value>,
    /// Lifecycle status.
    pub status: MessageStatus,
    /// 1 = highest … 10 = lowest.
    pub priority: i32,
    /// Final response, once handled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Failure description, if handling failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether handling this message spawned a background task.
    pub spawned_parallel: bool,
    /// The spawned task, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    /// When the message was enqueued.
    pub created_at: DateTime<Utc>,
    /// When handling began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When handling reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Parameters for enqueueing a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub external_id: String,
    pub channel: String,
    pub sender: String,
    pub content: String,
    pub attachments: Option<serde_json::Value>,
    pub priority: i32,
}

impl NewMessage {
    /// Create a new message with default priority.
    pub fn new(
        external_id: impl Into<String>,
        channel: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            channel: channel.into(),
            sender: sender.into(),
            content: content.into(),
            attachments: None,
            priority: 5,
        }
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set attachment references.
    pub fn with_attachments(mut self, attachments: serde_json::Value) -> Self {
        self.attachments = Some(attachments);
        self
    }
}

/// One unit of deferrable background work, optionally part of a chain.
///
/// `description` and `context` are opaque to the queue; only the executor
/// a worker runs interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegatedTask {
    /// Unique ID.
    pub id: Uuid,
    /// Free-text description of the work.
    pub description: String,
    /// Opaque context blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// 1 = highest … 10 = lowest.
    pub priority: i32,
    /// Chain/DAG identifier shared by related tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Tasks that must complete before this one is claimable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<Uuid>,
    /// Worker/session identifier holding the claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// A retrying task is not claimable before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_at: Option<DateTime<Utc>>,
    /// Failures so far. Never exceeds `max_retries`.
    pub retry_count: i32,
    /// Retry budget; once spent, the next failure is terminal.
    pub max_retries: i32,
    /// Result payload, on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Where the completion notice goes (endpoint URL), if anywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_channel: Option<String>,
    /// Whether the completion notice was delivered.
    pub notification_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for delegating a task.
#[derive(Debug, Clone, Default)]
pub struct TaskRequest {
    pub description: String,
    pub context: Option<serde_json::Value>,
    pub priority: i32,
    pub max_retries: Option<i32>,
    pub notify_channel: Option<String>,
    pub depends_on: Vec<Uuid>,
    pub group_id: Option<String>,
}

impl TaskRequest {
    /// Create a task request with default priority.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            priority: 5,
            ..Default::default()
        }
    }

    /// Builder: set opaque context.
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set the retry budget.
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Builder: set the notification endpoint.
    pub fn with_notify_channel(mut self, channel: impl Into<String>) -> Self {
        self.notify_channel = Some(channel.into());
        self
    }

    /// Builder: add a dependency.
    pub fn depends_on(mut self, task_id: Uuid) -> Self {
        self.depends_on.push(task_id);
        self
    }

    /// Builder: set the chain identifier.
    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }
}

/// One step of a task chain submitted through `create_task_chain`.
///
/// `depends_on_indices` reference earlier steps in the same submission, which
/// keeps the inserted group structurally acyclic.
#[derive(Debug, Clone, Default)]
pub struct ChainStep {
    pub description: String,
    pub context: Option<serde_json::Value>,
    pub priority: i32,
    pub max_retries: Option<i32>,
    pub notify_channel: Option<String>,
    pub depends_on_indices: Vec<usize>,
}

impl ChainStep {
    /// Create a chain step with default priority.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            priority: 5,
            ..Default::default()
        }
    }

    /// Builder: depend on an earlier step by its index in the submission.
    pub fn after(mut self, index: usize) -> Self {
        self.depends_on_indices.push(index);
        self
    }

    /// Builder: set opaque context.
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Builder: set the notification endpoint.
    pub fn with_notify_channel(mut self, channel: impl Into<String>) -> Self {
        self.notify_channel = Some(channel.into());
        self
    }
}

/// Timestamped note a running worker appends to its task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub id: String,
    pub task_id: Uuid,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregate status of a chain, counted without walking the graph.
///
/// `pending` covers every non-terminal member (waiting, claimed, running
/// included), so the three counts always sum to `total`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    pub group_id: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
}

/// Operational snapshot of the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub messages_pending: usize,
    pub messages_processing: usize,
    /// Pending tasks, eligible and blocked alike.
    pub tasks_pending: usize,
    /// Subset of pending tasks blocked on unmet dependencies or backoff.
    pub tasks_blocked: usize,
    pub tasks_claimed: usize,
    pub tasks_running: usize,
    pub tasks_completed_last_hour: usize,
    pub tasks_failed_last_hour: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_defaults() {
        let msg = NewMessage::new("ext-1", "chat", "alice", "hello");
        assert_eq!(msg.priority, 5);
        assert!(msg.attachments.is_none());
        assert_eq!(msg.external_id, "ext-1");
    }

    #[test]
    fn message_builder_methods() {
        let msg = NewMessage::new("ext-1", "chat", "alice", "hello")
            .with_priority(1)
            .with_attachments(serde_json::json!(["file://report.pdf"]));
        assert_eq!(msg.priority, 1);
        assert!(msg.attachments.is_some());
    }

    #[test]
    fn task_request_builder() {
        let dep = Uuid::new_v4();
        let req = TaskRequest::new("summarize inbox")
            .with_priority(2)
            .with_max_retries(1)
            .with_notify_channel("https://hooks.example/done")
            .with_context(serde_json::json!({"folder": "INBOX"}))
            .depends_on(dep)
            .with_group("g1");
        assert_eq!(req.priority, 2);
        assert_eq!(req.max_retries, Some(1));
        assert_eq!(req.depends_on, vec![dep]);
        assert_eq!(req.group_id.as_deref(), Some("g1"));
    }

    #[test]
    fn chain_step_after() {
        let step = ChainStep::new("second").after(0);
        assert_eq!(step.depends_on_indices, vec![0]);
        assert_eq!(step.priority, 5);
    }

    #[test]
    fn chain_status_counts_sum() {
        let status = ChainStatus {
            group_id: "g1".into(),
            total: 5,
            completed: 2,
            failed: 1,
            pending: 2,
        };
        assert_eq!(status.completed + status.failed + status.pending, status.total);
    }

    #[test]
    fn task_serde_omits_empty_optionals() {
        let task = DelegatedTask {
            id: Uuid::new_v4(),
            description: "t".into(),
            context: None,
            status: TaskStatus::Pending,
            priority: 5,
            group_id: None,
            depends_on: Vec::new(),
            claimed_by: None,
            claimed_at: None,
            started_at: None,
            completed_at: None,
            available_at: None,
            retry_count: 0,
            max_retries: 3,
            result: None,
            error: None,
            notify_channel: None,
            notification_sent: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&task).unwrap();
        assert!(!json.contains("\"context\""));
        assert!(!json.contains("\"claimed_by\""));
        assert!(!json.contains("\"depends_on\""));
        assert!(!json.contains("\"result\""));
    }
}
