//! Cancellable background tasks
//!
//! A single-assignment, cancel-and-replace wrapper around one background
//! job, with the same shape on the cooperative scheduler and on the
//! worker-thread pool.

mod handle;

pub use handle::{
    AsyncTaskHandle, CancellableTask, ExecutionBackend, TaskError, TaskHandle, TaskOutcome,
    TaskSpawner, ThreadTaskHandle,
};
