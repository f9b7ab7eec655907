//! Durable queue — data model, state machines, and the producer facade.
//!
//! Core components:
//! - `model` — message/task/progress rows and request builders
//! - `state` — the claim-protocol state machines
//! - `producer` — validated enqueue/delegate/chain/status API

pub mod model;
pub mod producer;
pub mod state;

pub use model::{
    ChainStatus, ChainStep, DelegatedTask, NewMessage, ProgressUpdate, QueueStats, QueuedMessage,
    TaskRequest,
};
pub use producer::Producer;
pub use state::{MessageStatus, TaskStatus};
