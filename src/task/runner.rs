use std::any::Any;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, warn};

use crate::error::{Cancelled, TaskPanicked};
use crate::task::progress::{ProgressEvent, TaskContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Cancelled,
    Completed,
    Failed,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Pending,
            1 => TaskState::Running,
            2 => TaskState::Cancelled,
            3 => TaskState::Completed,
            _ => TaskState::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Running => 1,
            TaskState::Cancelled => 2,
            TaskState::Completed => 3,
            TaskState::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Cancelled | TaskState::Completed | TaskState::Failed)
    }
}

/// The single terminal result of a task
#[derive(Debug)]
pub enum TaskOutcome<T, E> {
    Completed(T),
    Failed(E),
    Cancelled,
}

impl<T, E> TaskOutcome<T, E> {
    fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Completed(_) => TaskState::Completed,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Cancelled => TaskState::Cancelled,
        }
    }

    pub fn into_result(self) -> Result<T, E>
    where
        E: From<Cancelled>,
    {
        match self {
            TaskOutcome::Completed(value) => Ok(value),
            TaskOutcome::Failed(err) => Err(err),
            TaskOutcome::Cancelled => Err(E::from(Cancelled)),
        }
    }
}

#[derive(Debug)]
struct TaskShared {
    state: AtomicU8,
    progress: Arc<AtomicU64>,
    cancel_flag: Arc<AtomicBool>,
}

impl TaskShared {
    fn set_state(&self, state: TaskState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

/// Caller-side handle to a submitted task
pub struct TaskHandle<T, E> {
    id: u64,
    label: String,
    shared: Arc<TaskShared>,
    events: Receiver<ProgressEvent>,
    outcome: oneshot::Receiver<TaskOutcome<T, E>>,
}

impl<T, E> TaskHandle<T, E> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Overall progress (0.0 ~ 1.0)
    pub fn progress(&self) -> f64 {
        f64::from_bits(self.shared.progress.load(Ordering::Relaxed))
    }

    /// Request cooperative cancellation; the worker stops at its next safe point
    pub fn cancel(&self) {
        self.shared.cancel_flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancel_flag.load(Ordering::Relaxed)
    }

    /// Drain every queued progress event without blocking
    pub fn poll(&self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Block the calling thread until the task reaches its terminal state.
    ///
    /// Must not be called from inside an async context.
    pub fn wait(self) -> TaskOutcome<T, E> {
        self.outcome.blocking_recv().unwrap_or(TaskOutcome::Cancelled)
    }
}

type FinishCallback<T, E> = Box<dyn FnOnce(&TaskOutcome<T, E>) + Send + 'static>;

/// Bounded pool of blocking workers with cooperative cancellation
pub struct TaskRunner {
    runtime: Runtime,
    permits: Arc<Semaphore>,
    worker_threads: usize,
    next_id: AtomicU64,
}

impl TaskRunner {
    pub fn new(worker_threads: usize) -> io::Result<Self> {
        let worker_threads = worker_threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(worker_threads)
            .thread_name("filevault-worker")
            .enable_time()
            .build()?;
        Ok(Self {
            runtime,
            permits: Arc::new(Semaphore::new(worker_threads)),
            worker_threads,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn spawn<T, E, F>(&self, label: impl Into<String>, work: F) -> TaskHandle<T, E>
    where
        T: Send + 'static,
        E: From<TaskPanicked> + Send + 'static,
        F: FnOnce(&TaskContext) -> Result<T, E> + Send + 'static,
    {
        self.submit(label.into(), work, None)
    }

    /// Like `spawn`, and `on_finish` runs exactly once with the terminal outcome
    pub fn spawn_with_callback<T, E, F, C>(&self, label: impl Into<String>, work: F, on_finish: C) -> TaskHandle<T, E>
    where
        T: Send + 'static,
        E: From<TaskPanicked> + Send + 'static,
        F: FnOnce(&TaskContext) -> Result<T, E> + Send + 'static,
        C: FnOnce(&TaskOutcome<T, E>) + Send + 'static,
    {
        self.submit(label.into(), work, Some(Box::new(on_finish)))
    }

    fn submit<T, E, F>(&self, label: String, work: F, on_finish: Option<FinishCallback<T, E>>) -> TaskHandle<T, E>
    where
        T: Send + 'static,
        E: From<TaskPanicked> + Send + 'static,
        F: FnOnce(&TaskContext) -> Result<T, E> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(TaskShared {
            state: AtomicU8::new(TaskState::Pending.as_u8()),
            progress: Arc::new(AtomicU64::new(0f64.to_bits())),
            cancel_flag: Arc::new(AtomicBool::new(false)),
        });
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let ctx = TaskContext::new(Arc::clone(&shared.cancel_flag), Arc::clone(&shared.progress), tx);

        let permits = Arc::clone(&self.permits);
        let task_shared = Arc::clone(&shared);
        let task_label = label.clone();
        debug!(task = id, label = %label, "task submitted");

        self.runtime.spawn(async move {
            // Closed semaphore never happens; run unbounded rather than drop the task.
            let _permit = permits.acquire_owned().await.ok();

            let outcome = if ctx.is_cancelled() {
                TaskOutcome::Cancelled
            } else {
                task_shared.set_state(TaskState::Running);
                let worker_ctx = ctx.clone();
                match tokio::task::spawn_blocking(move || work(&worker_ctx)).await {
                    Ok(Ok(value)) => TaskOutcome::Completed(value),
                    Ok(Err(_)) if ctx.is_cancelled() => TaskOutcome::Cancelled,
                    Ok(Err(err)) => TaskOutcome::Failed(err),
                    Err(join_err) => {
                        let message = if join_err.is_panic() {
                            panic_message(join_err.into_panic())
                        } else {
                            "worker was aborted".to_string()
                        };
                        warn!(task = id, label = %task_label, error = %message, "task panicked");
                        TaskOutcome::Failed(E::from(TaskPanicked(message)))
                    }
                }
            };

            if let TaskOutcome::Completed(_) = outcome {
                ctx.set_progress(1.0);
            }
            task_shared.set_state(outcome.state());
            debug!(task = id, label = %task_label, state = ?outcome.state(), "task finished");

            if let Some(callback) = on_finish {
                callback(&outcome);
            }
            let _ = done_tx.send(outcome);
        });

        TaskHandle { id, label, shared, events: rx, outcome: done_rx }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_completed_outcome() {
        let runner = TaskRunner::new(2).unwrap();
        let handle = runner.spawn("sum", |_ctx| Ok::<_, Error>(2 + 2));
        assert!(handle.id() > 0);
        match handle.wait() {
            TaskOutcome::Completed(v) => assert_eq!(v, 4),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_failed_outcome() {
        let runner = TaskRunner::new(1).unwrap();
        let handle = runner.spawn("fail", |_ctx| -> Result<(), Error> { Err(Error::Cancelled) });
        // Err without a cancel request is a failure, whatever the variant
        assert!(matches!(handle.wait(), TaskOutcome::Failed(Error::Cancelled)));
    }

    #[test]
    fn test_panic_becomes_failed() {
        let runner = TaskRunner::new(1).unwrap();
        let handle = runner.spawn("boom", |_ctx| -> Result<(), Error> { panic!("kaboom") });
        match handle.wait() {
            TaskOutcome::Failed(Error::TaskPanicked(TaskPanicked(msg))) => assert!(msg.contains("kaboom")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_cooperative_cancellation() {
        let runner = TaskRunner::new(1).unwrap();
        let (started_tx, started_rx) = std_mpsc::channel();
        let handle = runner.spawn("spin", move |ctx| -> Result<(), Error> {
            let _ = started_tx.send(());
            loop {
                ctx.checkpoint()?;
                thread::sleep(Duration::from_millis(5));
            }
        });
        started_rx.recv().unwrap();
        assert_eq!(handle.state(), TaskState::Running);
        handle.cancel();
        assert!(matches!(handle.wait(), TaskOutcome::Cancelled));
    }

    #[test]
    fn test_cancel_before_start_skips_work() {
        let runner = TaskRunner::new(1).unwrap();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let (started_tx, started_rx) = std_mpsc::channel();
        let blocker = runner.spawn("blocker", move |_ctx| {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
            Ok::<_, Error>(())
        });
        started_rx.recv().unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_task = Arc::clone(&ran);
        let queued = runner.spawn("queued", move |_ctx| {
            ran_in_task.store(true, Ordering::SeqCst);
            Ok::<_, Error>(())
        });
        queued.cancel();
        assert_eq!(queued.state(), TaskState::Pending);
        release_tx.send(()).unwrap();

        assert!(matches!(blocker.wait(), TaskOutcome::Completed(())));
        assert!(matches!(queued.wait(), TaskOutcome::Cancelled));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_progress_events_and_callback() {
        let runner = TaskRunner::new(2).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_cb = Arc::clone(&calls);
        let handle = runner.spawn_with_callback(
            "events",
            |ctx| {
                ctx.send(ProgressEvent::ItemStarted("a".into()));
                ctx.report_bytes(5, 10);
                ctx.send(ProgressEvent::ItemCompleted("a".into()));
                Ok::<_, Error>("done")
            },
            move |outcome| {
                assert!(matches!(outcome, TaskOutcome::Completed("done")));
                calls_in_cb.fetch_add(1, Ordering::SeqCst);
            },
        );

        // Keep the handle alive to drain events after completion
        while !handle.state().is_terminal() {
            thread::sleep(Duration::from_millis(5));
        }
        let events = handle.poll();
        assert_eq!(
            events,
            vec![
                ProgressEvent::ItemStarted("a".into()),
                ProgressEvent::Bytes { done: 5, total: 10 },
                ProgressEvent::ItemCompleted("a".into()),
            ]
        );
        assert_eq!(handle.progress(), 1.0);
        assert!(matches!(handle.wait(), TaskOutcome::Completed("done")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_into_result_maps_cancelled() {
        let outcome: TaskOutcome<(), Error> = TaskOutcome::Cancelled;
        assert!(matches!(outcome.into_result(), Err(Error::Cancelled)));
    }
}
