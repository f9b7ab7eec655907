//! Producer and status API — the validated facade over the store.
//!
//! Consumed by the conversational agent and any external trigger. Malformed
//! requests are rejected here, before anything is written; the immediate
//! acknowledgment (the returned id) is separate from task completion.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, TaskError};
use crate::queue::model::{ChainStatus, ChainStep, DelegatedTask, NewMessage, TaskRequest};
use crate::queue::state::TaskStatus;
use crate::store::Database;

/// Producer handle. Cheap to clone; all state lives in the store.
#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn Database>,
}

impl Producer {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// Enqueue an inbound message. Idempotent on `external_id`: re-delivery
    /// returns the existing id without inserting a second row.
    pub async fn enqueue_message(&self, message: NewMessage) -> Result<String> {
        validate_priority(message.priority)?;
        if message.external_id.trim().is_empty() || message.content.trim().is_empty() {
            return Err(TaskError::EmptyMessage.into());
        }
        let id = self.store.enqueue_message(&message).await?;
        debug!(id = %id, external_id = %message.external_id, "Message enqueued");
        Ok(id)
    }

    /// Delegate one background task.
    pub async fn delegate_task(&self, mut request: TaskRequest) -> Result<Uuid> {
        validate_priority(request.priority)?;
        if request.description.trim().is_empty() {
            return Err(TaskError::EmptyDescription.into());
        }
        request.depends_on.dedup();
        for dep in &request.depends_on {
            if self.store.get_task(*dep).await?.is_none() {
                return Err(TaskError::UnknownDependency { id: *dep }.into());
            }
        }
        let id = self.store.insert_task(&request).await?;
        info!(task_id = %id, priority = request.priority, "Task delegated");
        Ok(id)
    }

    /// Atomically insert a DAG of tasks sharing one `group_id`.
    ///
    /// Each step may only depend on earlier steps of the same submission.
    pub async fn create_task_chain(&self, steps: Vec<ChainStep>) -> Result<Vec<Uuid>> {
        if steps.is_empty() {
            return Err(TaskError::EmptyChain.into());
        }
        for (position, step) in steps.iter().enumerate() {
            validate_priority(step.priority)?;
            if step.description.trim().is_empty() {
                return Err(TaskError::EmptyDescription.into());
            }
            for &index in &step.depends_on_indices {
                if index >= position {
                    return Err(TaskError::ForwardDependency {
                        step: position,
                        index,
                    }
                    .into());
                }
            }
        }
        let ids = self.store.insert_task_chain(&steps).await?;
        info!(count = ids.len(), "Task chain created");
        Ok(ids)
    }

    /// Fetch a task's full status (result/error and timestamps included).
    pub async fn get_status(&self, id: Uuid) -> Result<Option<DelegatedTask>> {
        Ok(self.store.get_task(id).await?)
    }

    /// Aggregate chain status without walking the graph.
    pub async fn get_chain_status(&self, group_id: &str) -> Result<ChainStatus> {
        Ok(self.store.get_chain_status(group_id).await?)
    }

    /// List tasks, optionally filtered by status, most recent first.
    pub async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<DelegatedTask>> {
        Ok(self.store.list_tasks(status, limit).await?)
    }
}

fn validate_priority(priority: i32) -> Result<()> {
    if !(1..=10).contains(&priority) {
        return Err(TaskError::InvalidPriority { given: priority }.into());
    }
    Ok(())
}
