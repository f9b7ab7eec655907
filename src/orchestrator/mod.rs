//! Orchestrator — supervisor loop, worker launching, message intake.
//!
//! Core components:
//! - `supervisor` — the poll loop: reclaim, claim, launch, monitor, notify
//! - `launcher` — the process-management seam (`WorkerLauncher`)
//! - `pump` — inbound message intake behind the `MessageHandler` seam

pub mod launcher;
pub mod pump;
pub mod supervisor;

pub use launcher::{ProcessLauncher, WorkerHandle, WorkerLauncher};
pub use pump::{DelegatingHandler, MessageHandler, MessageOutcome};
pub use supervisor::Supervisor;
