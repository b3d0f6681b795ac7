use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::error::Cancelled;

/// Progress message sent from a worker to whoever polls its handle
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Preparing(String),
    ItemStarted(String),
    ItemCompleted(String),
    /// (item, error message)
    ItemFailed(String, String),
    Bytes { done: u64, total: u64 },
}

/// Worker-side view of a task: cancellation flag, progress gauge and event queue.
///
/// Components take `&TaskContext` so the same code runs inline (with a
/// detached context) or under a `TaskRunner`.
#[derive(Debug, Clone)]
pub struct TaskContext {
    cancel_flag: Arc<AtomicBool>,
    progress: Arc<AtomicU64>,
    sender: Option<Sender<ProgressEvent>>,
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::detached()
    }
}

impl TaskContext {
    pub(crate) fn new(cancel_flag: Arc<AtomicBool>, progress: Arc<AtomicU64>, sender: Sender<ProgressEvent>) -> Self {
        Self { cancel_flag, progress, sender: Some(sender) }
    }

    /// A context nobody listens to; only cancelled through `cancel_flag()`
    pub fn detached() -> Self {
        Self {
            cancel_flag: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(AtomicU64::new(0f64.to_bits())),
            sender: None,
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }

    /// Safe point: bail out with `Cancelled` once cancellation was requested
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Fraction in 0.0 ~ 1.0; out-of-range values are clamped
    pub fn set_progress(&self, fraction: f64) {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        self.progress.store(fraction.to_bits(), Ordering::Relaxed);
    }

    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Relaxed))
    }

    /// Queue-and-return; a dropped handle just discards events
    pub fn send(&self, event: ProgressEvent) {
        if let Some(ref sender) = self.sender {
            let _ = sender.send(event);
        }
    }

    /// `Bytes` event plus the matching progress fraction
    pub fn report_bytes(&self, done: u64, total: u64) {
        if total > 0 {
            self.set_progress(done as f64 / total as f64);
        }
        self.send(ProgressEvent::Bytes { done, total });
    }
}
