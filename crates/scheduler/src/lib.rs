//! Reader background scheduling
//!
//! A generation-counted worker that runs the newest request and drops stale
//! ones, cooperative cancellation tokens, and the layout service built on
//! top of them.

mod cancel;
mod layout_service;
mod worker;

pub use cancel::CancellationToken;
pub use layout_service::{LayoutOutcome, LayoutRequest, LayoutService, LayoutTicket};
pub use worker::{Executor, GenerationWorker, Outcome, Ticket, WorkerConfig};

/// Errors from the background worker
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker has been shut down")]
    ShutDown,

    #[error("worker thread exited before replying")]
    Disconnected,

    #[error("worker thread panicked")]
    WorkerPanicked,
}
