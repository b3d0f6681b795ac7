//! Cancellable background work with progress reporting

mod progress;
mod runner;

pub use progress::{ProgressEvent, TaskContext};
pub use runner::{TaskHandle, TaskOutcome, TaskRunner, TaskState};
