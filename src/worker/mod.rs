//! Worker process internals.
//!
//! Core components:
//! - `executor` — the opaque-payload execution seam (`TaskExecutor`)
//! - `runner` — claim verification, execution, terminal status writes

pub mod executor;
pub mod runner;

pub use executor::{ProgressSink, ShellExecutor, StoreProgress, TaskExecutor};
pub use runner::WorkerRunner;
