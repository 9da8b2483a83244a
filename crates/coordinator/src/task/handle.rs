//! Cancellable task handles
//!
//! One background job, one handle. Two backends share the same contract:
//!
//! - [`AsyncTaskHandle`] runs the job on the tokio scheduler. Cancellation is
//!   cooperative and takes effect at the job's next suspension point.
//! - [`ThreadTaskHandle`] runs the job on a bounded pool of blocking threads.
//!   Cancellation is advisory: a job that has not started yet is skipped, a
//!   job that is already running completes, and it is up to the job to check
//!   its token before committing a result.
//!
//! Either way the job receives a [`CancellationToken`]; it must consult
//! `token.is_cancelled()` before applying any result.
//!
//! Jobs are spawned through a runtime [`Handle`], so a [`TaskSpawner`] built
//! inside the runtime can be used from plain OS threads.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Errors from waiting on a task
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The job panicked
    #[error("task {0} panicked")]
    Panicked(Uuid),

    /// The handle was already joined
    #[error("task {0} was already joined")]
    AlreadyJoined(Uuid),
}

/// How a finished job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The job ran to completion
    Completed,
    /// The job was cancelled before it started, or stopped at a suspension point
    Cancelled,
}

/// Uniform handle to one concurrently running background job
#[async_trait]
pub trait CancellableTask: Send + Sync + std::fmt::Debug {
    /// Unique id of this job
    fn id(&self) -> Uuid;

    /// Human-readable label (used in logs)
    fn label(&self) -> &str;

    /// Request cancellation
    fn cancel(&self);

    /// Whether cancellation was requested
    fn is_cancelled(&self) -> bool;

    /// Whether the job has finished (completed, cancelled or panicked)
    fn is_done(&self) -> bool;

    /// Wait for the job to finish
    async fn wait(&mut self) -> Result<TaskOutcome, TaskError>;
}

/// Boxed handle, the shape callers store
pub type TaskHandle = Box<dyn CancellableTask>;

/// Which backend background jobs run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ExecutionBackend {
    /// Cooperative tasks on the tokio scheduler
    #[default]
    Cooperative,
    /// A bounded pool of OS threads
    WorkerThreads { max_threads: usize },
}

/// Sets a flag when dropped, so `is_done` holds even if the job panics
struct DoneGuard(Arc<AtomicBool>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Handle to a job on the cooperative scheduler
#[derive(Debug)]
pub struct AsyncTaskHandle {
    id: Uuid,
    label: String,
    token: CancellationToken,
    done: Arc<AtomicBool>,
    join: Option<JoinHandle<TaskOutcome>>,
}

impl AsyncTaskHandle {
    /// Spawn `job` on `runtime`
    pub fn spawn<F, Fut>(label: impl Into<String>, runtime: &Handle, job: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = Uuid::now_v7();
        let label = label.into();
        let token = CancellationToken::new();
        let done = Arc::new(AtomicBool::new(false));

        let fut = job(token.clone());
        let task_token = token.clone();
        let guard = DoneGuard(done.clone());
        let join = runtime.spawn(async move {
            let _guard = guard;
            tokio::select! {
                biased;
                _ = task_token.cancelled() => TaskOutcome::Cancelled,
                _ = fut => TaskOutcome::Completed,
            }
        });

        trace!(task_id = %id, %label, "spawned cooperative task");
        Self {
            id,
            label,
            token,
            done,
            join: Some(join),
        }
    }
}

#[async_trait]
impl CancellableTask for AsyncTaskHandle {
    fn id(&self) -> Uuid {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn cancel(&self) {
        self.token.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    async fn wait(&mut self) -> Result<TaskOutcome, TaskError> {
        let join = self.join.take().ok_or(TaskError::AlreadyJoined(self.id))?;
        join.await.map_err(|_| TaskError::Panicked(self.id))
    }
}

/// Handle to a job on the worker-thread pool
#[derive(Debug)]
pub struct ThreadTaskHandle {
    id: Uuid,
    label: String,
    token: CancellationToken,
    started: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
    join: Option<JoinHandle<TaskOutcome>>,
}

impl ThreadTaskHandle {
    /// Queue `job` on the pool; it starts once a thread slot is free
    pub fn spawn<F, Fut>(
        label: impl Into<String>,
        runtime: &Handle,
        slots: Arc<Semaphore>,
        job: F,
    ) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = Uuid::now_v7();
        let label = label.into();
        let token = CancellationToken::new();
        let started = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));

        let fut = job(token.clone());
        let task_token = token.clone();
        let task_started = started.clone();
        let guard = DoneGuard(done.clone());
        let blocking_runtime = runtime.clone();
        let job_runtime = runtime.clone();

        let join = runtime.spawn(async move {
            let _guard = guard;

            // Waiting for a slot is the only window where cancellation is honored
            let permit = tokio::select! {
                biased;
                _ = task_token.cancelled() => return TaskOutcome::Cancelled,
                permit = slots.acquire_owned() => permit,
            };
            let Ok(_permit) = permit else {
                return TaskOutcome::Cancelled;
            };

            let thread_token = task_token.clone();
            let blocking = blocking_runtime.spawn_blocking(move || {
                if thread_token.is_cancelled() {
                    return TaskOutcome::Cancelled;
                }
                task_started.store(true, Ordering::Release);
                // Once running, the job cannot be preempted
                job_runtime.block_on(fut);
                TaskOutcome::Completed
            });

            match blocking.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => TaskOutcome::Cancelled,
            }
        });

        trace!(task_id = %id, %label, "queued worker-thread task");
        Self {
            id,
            label,
            token,
            started,
            done,
            join: Some(join),
        }
    }

    /// Whether the job has started running on a thread
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

#[async_trait]
impl CancellableTask for ThreadTaskHandle {
    fn id(&self) -> Uuid {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn cancel(&self) {
        if self.has_started() && !self.is_done() {
            debug!(
                task_id = %self.id,
                label = %self.label,
                "task already running on a worker thread; its result will be discarded"
            );
        }
        self.token.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    async fn wait(&mut self) -> Result<TaskOutcome, TaskError> {
        let join = self.join.take().ok_or(TaskError::AlreadyJoined(self.id))?;
        join.await.map_err(|_| TaskError::Panicked(self.id))
    }
}

/// Spawns jobs on the configured backend
///
/// The runtime is captured when the spawner is built. A spawner built
/// outside any runtime falls back to the caller's runtime at spawn time.
#[derive(Debug, Clone)]
pub struct TaskSpawner {
    backend: ExecutionBackend,
    slots: Arc<Semaphore>,
    runtime: Option<Handle>,
}

impl TaskSpawner {
    pub fn new(backend: ExecutionBackend) -> Self {
        let permits = match backend {
            ExecutionBackend::Cooperative => 0,
            ExecutionBackend::WorkerThreads { max_threads } => max_threads.max(1),
        };
        Self {
            backend,
            slots: Arc::new(Semaphore::new(permits)),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Spawn onto `runtime` regardless of where `spawn` is called from
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn backend(&self) -> ExecutionBackend {
        self.backend
    }

    /// Spawn a job and return its handle
    ///
    /// Returns `None` (logged) when there is no runtime to spawn onto.
    pub fn spawn<F, Fut>(&self, label: impl Into<String>, job: F) -> Option<TaskHandle>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        let Some(runtime) = self
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
        else {
            warn!(%label, "no tokio runtime available; task not started");
            return None;
        };

        let handle: TaskHandle = match self.backend {
            ExecutionBackend::Cooperative => {
                Box::new(AsyncTaskHandle::spawn(label, &runtime, job))
            }
            ExecutionBackend::WorkerThreads { .. } => Box::new(ThreadTaskHandle::spawn(
                label,
                &runtime,
                Arc::clone(&self.slots),
                job,
            )),
        };
        Some(handle)
    }
}

impl Default for TaskSpawner {
    fn default() -> Self {
        Self::new(ExecutionBackend::Cooperative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_async_task_completes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let runtime = Handle::current();
        let mut handle = AsyncTaskHandle::spawn("count", &runtime, move |_token| async move {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(handle.wait().await.unwrap(), TaskOutcome::Completed);
        assert!(handle.is_done());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_task_cancelled_at_suspension_point() {
        let reached_end = Arc::new(AtomicBool::new(false));
        let end = reached_end.clone();
        let gate = Arc::new(Notify::new());
        let g = gate.clone();

        let runtime = Handle::current();
        let mut handle = AsyncTaskHandle::spawn("blocked", &runtime, move |_token| async move {
            g.notified().await;
            end.store(true, Ordering::SeqCst);
        });

        handle.cancel();
        gate.notify_one();

        assert_eq!(handle.wait().await.unwrap(), TaskOutcome::Cancelled);
        assert!(handle.is_cancelled());
        assert!(!reached_end.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_wait_twice_is_an_error() {
        let mut handle = AsyncTaskHandle::spawn("noop", &Handle::current(), |_token| async {});
        handle.wait().await.unwrap();
        assert!(matches!(
            handle.wait().await,
            Err(TaskError::AlreadyJoined(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_thread_task_cancelled_before_start_is_skipped() {
        // One slot, held by a long job, so the second job stays queued
        let spawner = TaskSpawner::new(ExecutionBackend::WorkerThreads { max_threads: 1 });
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let (s, r) = (started.clone(), release.clone());
        let mut first = spawner
            .spawn("first", move |_token| async move {
                s.notify_one();
                r.notified().await;
            })
            .unwrap();
        started.notified().await;

        let ran = Arc::new(AtomicBool::new(false));
        let ran_flag = ran.clone();
        let mut second = spawner
            .spawn("second", move |_token| async move {
                ran_flag.store(true, Ordering::SeqCst);
            })
            .unwrap();

        second.cancel();
        release.notify_one();

        assert_eq!(first.wait().await.unwrap(), TaskOutcome::Completed);
        assert_eq!(second.wait().await.unwrap(), TaskOutcome::Cancelled);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_thread_task_runs_to_completion_after_cancel() {
        let spawner = TaskSpawner::new(ExecutionBackend::WorkerThreads { max_threads: 2 });
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let saw_cancel = Arc::new(AtomicBool::new(false));

        let (s, r, seen) = (started.clone(), release.clone(), saw_cancel.clone());
        let mut handle = spawner
            .spawn("running", move |token| async move {
                s.notify_one();
                r.notified().await;
                seen.store(token.is_cancelled(), Ordering::SeqCst);
            })
            .unwrap();

        started.notified().await;
        handle.cancel();
        release.notify_one();

        // Not preempted: the job finished and observed the cancellation itself
        assert_eq!(handle.wait().await.unwrap(), TaskOutcome::Completed);
        assert!(saw_cancel.load(Ordering::SeqCst));
        assert!(handle.is_done());
    }

    #[tokio::test]
    async fn test_done_flag_tracks_completion() {
        let gate = Arc::new(Notify::new());
        let g = gate.clone();
        let mut handle = TaskSpawner::default()
            .spawn("gated", move |_token| async move {
                g.notified().await;
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_done());

        gate.notify_one();
        handle.wait().await.unwrap();
        assert!(handle.is_done());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawn_from_plain_thread_uses_captured_runtime() {
        let spawner = TaskSpawner::new(ExecutionBackend::WorkerThreads { max_threads: 1 });
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();

        let handle = std::thread::spawn(move || {
            spawner.spawn("from-thread", move |_token| async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
        })
        .join()
        .unwrap();

        let mut handle = handle.expect("spawner captured the test runtime");
        assert_eq!(handle.wait().await.unwrap(), TaskOutcome::Completed);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawn_without_runtime_returns_none() {
        let spawner = TaskSpawner::new(ExecutionBackend::Cooperative);
        assert!(spawner.spawn("orphan", |_token| async {}).is_none());
    }
}
