//! Task and message state machines.
//!
//! The enums here are the in-process mirror of the guarded SQL transitions in
//! the store backend: the database WHERE clauses are the authoritative guards,
//! these types document and test the same transition table.

use serde::{Deserialize, Serialize};

/// State of a delegated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed (or blocked on unmet dependencies; the
    /// `waiting` sub-state is computed from dependency status, never stored).
    Pending,
    /// A worker holds the claim but has not started executing.
    Claimed,
    /// A worker is executing the task.
    Running,
    /// Task finished and wrote a result.
    Completed,
    /// Task failed with its retry budget exhausted.
    Failed,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    ///
    /// `Claimed|Running → Pending` is the orphan-reclaim/retry path; it is the
    /// only transition the claim holder does not initiate.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Claimed)
                | (Claimed, Running)
                | (Claimed, Pending)
                | (Claimed, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Pending)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check if the task is live (claimed or executing).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Claimed | Self::Running)
    }

    /// Canonical database string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a database status string, defaulting unknown values to pending.
    pub fn parse(s: &str) -> Self {
        match s {
            "claimed" => Self::Claimed,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State of a queued interactive message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Awaiting pickup.
    Pending,
    /// Handed to the message handler.
    Processing,
    /// A response was produced.
    Completed,
    /// Handling failed.
    Failed,
}

impl MessageStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Canonical database string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a database status string, defaulting unknown values to pending.
    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
