//! Shared worker pool
//!
//! Every piece of background work in the process (catalog synchronization,
//! script jobs) is submitted here so that shutdown has a single place to act:
//! - bounded parallelism via a semaphore of worker permits
//! - one root cancellation token, with a child token handed to every task
//! - graceful drain (wait for everything submitted) or immediate teardown

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool has been shut down")]
    ShutDown,

    #[error("Worker pool must be created inside a tokio runtime")]
    NoRuntime,
}

struct PoolInner {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    handle: Handle,
    workers: usize,
    closed: AtomicBool,
}

/// Bounded, cancellable task pool. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool bound to the current tokio runtime.
    pub fn new(workers: usize) -> Result<Self, PoolError> {
        let handle = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;
        Ok(Self::with_handle(handle, workers))
    }

    /// Create a pool that spawns onto an explicit runtime handle.
    pub fn with_handle(handle: Handle, workers: usize) -> Self {
        let workers = workers.max(1);
        debug!("Creating worker pool with {} workers", workers);

        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(workers)),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                handle,
                workers,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Submit a task. Returns as soon as the task is queued.
    ///
    /// The closure receives a token that is cancelled when the pool shuts down
    /// immediately. Tasks still waiting for a worker when that happens are
    /// dropped without running.
    pub fn submit<F, Fut>(&self, name: &str, task: F) -> Result<(), PoolError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(PoolError::ShutDown);
        }

        let permits = Arc::clone(&self.inner.permits);
        let token = self.inner.shutdown.child_token();
        let name = name.to_string();

        self.inner.tracker.spawn_on(
            async move {
                let permit = tokio::select! {
                    _ = token.cancelled() => {
                        debug!(task = %name, "Pool shut down before task started");
                        return;
                    }
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };

                trace!(task = %name, "Task started");
                task(token).await;
                trace!(task = %name, "Task finished");
                drop(permit);
            },
            &self.inner.handle,
        );

        Ok(())
    }

    /// A token that is cancelled when the pool is torn down immediately.
    pub fn token(&self) -> CancellationToken {
        self.inner.shutdown.child_token()
    }

    /// Stop accepting work and wait for every submitted task to finish.
    pub async fn drain(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.tracker.close();
        info!(
            "Draining worker pool ({} tasks outstanding)",
            self.inner.tracker.len()
        );
        self.inner.tracker.wait().await;
        debug!("Worker pool drained");
    }

    /// Stop accepting work and cancel everything without waiting.
    pub fn shutdown_now(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.tracker.close();
        self.inner.shutdown.cancel();
        info!(
            "Worker pool shut down immediately ({} tasks outstanding)",
            self.inner.tracker.len()
        );
    }

    /// Wait until every task has exited, including ones that were cancelled.
    pub async fn wait_idle(&self) {
        self.inner.tracker.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of tasks submitted and not yet finished.
    pub fn outstanding(&self) -> usize {
        self.inner.tracker.len()
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.inner.workers)
            .field("outstanding", &self.outstanding())
            .field("closed", &self.is_closed())
            .finish()
    }
}
