//! Error types for Offload.

use uuid::Uuid;

/// Top-level error type for the delegation engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task lifecycle and producer-boundary errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} is not claimable")]
    NotClaimable { id: Uuid },

    #[error("Worker {worker_id} does not hold the claim on task {id}")]
    NotClaimHolder { id: Uuid, worker_id: String },

    #[error("Invalid priority {given}: must be between 1 and 10")]
    InvalidPriority { given: i32 },

    #[error("Task description must not be empty")]
    EmptyDescription,

    #[error("Message external id and content must not be empty")]
    EmptyMessage,

    #[error("Unknown dependency: task {id} does not exist")]
    UnknownDependency { id: Uuid },

    #[error("A task chain must contain at least one step")]
    EmptyChain,

    #[error("Chain step {step} depends on step {index}, which is not an earlier step")]
    ForwardDependency { step: usize, index: usize },

    #[error("Task execution failed: {reason}")]
    ExecutionFailed { reason: String },
}

/// Worker process launch/management errors.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Failed to launch worker process: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker process handle lost: {0}")]
    HandleLost(String),
}

/// Notification delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Task has no notification channel")]
    NoChannel,

    #[error("HTTP delivery failed: {0}")]
    Http(String),

    #[error("Notification endpoint rejected delivery with status {status}")]
    Rejected { status: u16 },
}

/// Result type alias for the delegation engine.
pub type Result<T> = std::result::Result<T, Error>;
