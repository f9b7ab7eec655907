//! Message intake pump — drains pending messages to the message handler.
//!
//! The handler is the conversational agent's boundary: the pump owns the
//! durable bookkeeping (processing/completed/failed transitions, spawned-task
//! back-references) and the handler owns interpretation. The default
//! `DelegatingHandler` runs headless: every message becomes a background
//! task and the immediate acknowledgment points at it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::queue::model::{QueuedMessage, TaskRequest};
use crate::queue::producer::Producer;
use crate::store::Database;

/// Outcome of handling one message.
pub enum MessageOutcome {
    /// Handled inline; the text is the final response.
    Reply(String),
    /// Handling spawned a background task; `ack` is the immediate response.
    Delegated { task_id: Uuid, ack: String },
}

/// Interprets inbound messages. Out-of-scope consumers (the conversational
/// agent) implement this; the queue only carries and sequences.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &QueuedMessage) -> Result<MessageOutcome>;
}

/// Headless default: converts each message into a delegated task.
pub struct DelegatingHandler {
    producer: Producer,
    max_retries: i32,
}

impl DelegatingHandler {
    pub fn new(producer: Producer, max_retries: i32) -> Self {
        Self {
            producer,
            max_retries,
        }
    }
}

#[async_trait]
impl MessageHandler for DelegatingHandler {
    async fn handle(&self, message: &QueuedMessage) -> Result<MessageOutcome> {
        let mut request = TaskRequest::new(&message.content)
            .with_priority(message.priority)
            .with_max_retries(self.max_retries);
        if let Some(attachments) = &message.attachments {
            request = request.with_context(serde_json::json!({ "attachments": attachments }));
        }
        let task_id = self.producer.delegate_task(request).await?;
        Ok(MessageOutcome::Delegated {
            task_id,
            ack: format!("queued as task {task_id}"),
        })
    }
}

/// Drain up to `limit` pending messages through the handler.
///
/// Per-message failures are recorded on the row and never stop the batch.
/// Returns the number of messages taken.
pub async fn drain_messages(
    store: &Arc<dyn Database>,
    handler: &Arc<dyn MessageHandler>,
    limit: usize,
) -> usize {
    let pending = match store.pending_messages(limit).await {
        Ok(messages) => messages,
        Err(e) => {
            warn!(error = %e, "Failed to list pending messages");
            return 0;
        }
    };

    let mut taken = 0;
    for message in pending {
        // Another intake process may have raced us to it
        match store.begin_message(&message.id).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Failed to begin message");
                continue;
            }
        }
        taken += 1;

        match handler.handle(&message).await {
            Ok(MessageOutcome::Reply(text)) => {
                if let Err(e) = store.complete_message(&message.id, &text).await {
                    warn!(message_id = %message.id, error = %e, "Failed to complete message");
                }
                debug!(message_id = %message.id, "Message answered inline");
            }
            Ok(MessageOutcome::Delegated { task_id, ack }) => {
                if let Err(e) = store.link_spawned_task(&message.id, task_id).await {
                    warn!(message_id = %message.id, error = %e, "Failed to link spawned task");
                }
                if let Err(e) = store.complete_message(&message.id, &ack).await {
                    warn!(message_id = %message.id, error = %e, "Failed to complete message");
                }
                info!(message_id = %message.id, task_id = %task_id, "Message delegated to task");
            }
            Err(e) => {
                if let Err(write_err) = store.fail_message(&message.id, &e.to_string()).await {
                    warn!(message_id = %message.id, error = %write_err, "Failed to record message failure");
                }
                warn!(message_id = %message.id, error = %e, "Message handling failed");
            }
        }
    }
    taken
}
