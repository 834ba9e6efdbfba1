//! The worker pool: both queues, the monitor, and the worker set.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::monitor::Monitor;
use super::queue::{QueueEntry, WorkQueue};
use super::worker::{Worker, WorkerHandle};
use crate::app::Application;
use crate::config::ServerConfig;
use crate::error::ConfigError;

/// Receives a nudge whenever a worker dequeues a freshly accepted socket.
///
/// This is the only way workers influence pool sizing.
pub trait CapacityHint: Send + Sync {
    fn capacity_hint(&self);
}

/// A resizable set of [`Worker`]s sharing one active queue.
///
/// Dropping the pool does not stop its workers; call [`stop`](Self::stop).
pub struct WorkerPool<A: Application> {
    inner: Arc<PoolInner<A>>,
}

struct PoolInner<A> {
    app: Arc<A>,
    config: Arc<ServerConfig>,
    queue: WorkQueue,
    wait_queue: WorkQueue,
    workers: Mutex<Vec<WorkerHandle>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicUsize,
    /// Set once `stop` begins; the worker set is frozen from then on.
    stopping: AtomicBool,
    this: Weak<PoolInner<A>>,
}

/// Forwards hints to the pool without keeping it alive.
struct PoolHint<A>(Weak<PoolInner<A>>);

impl<A: Application> CapacityHint for PoolHint<A> {
    fn capacity_hint(&self) {
        if let Some(pool) = self.0.upgrade() {
            pool.capacity_hint();
        }
    }
}

impl<A: Application> WorkerPool<A> {
    /// Validates `config`, then spawns the monitor and `min_workers` workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(app: A, config: ServerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let inner = Arc::new_cyclic(|this| PoolInner {
            app: Arc::new(app),
            queue: WorkQueue::new(config.queue_capacity),
            wait_queue: WorkQueue::new(config.queue_capacity),
            config: Arc::new(config),
            workers: Mutex::new(Vec::new()),
            monitor: Mutex::new(None),
            next_id: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            this: this.clone(),
        });

        let monitor = Monitor::new(
            inner.wait_queue.clone(),
            inner.queue.clone(),
            Arc::clone(&inner.config),
        );
        *lock(&inner.monitor) = Some(monitor.spawn());
        inner.grow(inner.config.min_workers);

        info!(
            workers = inner.config.min_workers,
            max_workers = inner.config.max_workers,
            "worker pool started"
        );
        Ok(Self { inner })
    }

    /// The queue accepted connections are pushed onto.
    pub fn queue(&self) -> &WorkQueue {
        &self.inner.queue
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Spawns `amount` more workers. Does nothing once the pool is stopping.
    pub fn grow(&self, amount: usize) {
        self.inner.grow(amount);
    }

    /// Asks `amount` workers to exit once they finish their current connection.
    pub async fn shrink(&self, amount: usize) {
        for _ in 0..amount {
            if self.inner.queue.push_wait(QueueEntry::Terminate).await.is_err() {
                warn!("active queue closed while shrinking the pool");
                break;
            }
        }
    }

    /// Number of live workers. Exited workers are reaped first.
    pub fn worker_count(&self) -> usize {
        self.inner.worker_count()
    }

    /// Tears down every connection currently being served.
    pub fn kill_all(&self) {
        let workers = lock(&self.inner.workers);
        warn!(workers = workers.len(), "killing all active connections");
        for worker in workers.iter() {
            worker.kill();
        }
    }

    /// Stops the monitor and every worker, then closes both queues.
    ///
    /// Workers finish the connection they are serving first; call
    /// [`kill_all`](Self::kill_all) beforehand to cut them short.
    pub async fn stop(&self) {
        let inner = &self.inner;
        // Growth checks the flag under the workers lock, so once it is set the
        // set taken below is every worker that will ever pop a sentinel.
        inner.stopping.store(true, Ordering::SeqCst);
        if inner.wait_queue.push_wait(QueueEntry::Terminate).await.is_err() {
            debug!("wait-queue already closed");
        }

        let workers = std::mem::take(&mut *lock(&inner.workers));
        for _ in &workers {
            if inner.queue.push_wait(QueueEntry::Terminate).await.is_err() {
                break;
            }
        }
        for worker in workers {
            worker.join().await;
        }

        inner.queue.close().await;
        inner.wait_queue.close().await;

        let monitor = lock(&inner.monitor).take();
        if let Some(monitor) = monitor {
            if let Err(err) = monitor.await {
                warn!(error = %err, "monitor task failed");
            }
        }
        info!("worker pool stopped");
    }
}

impl<A: Application> PoolInner<A> {
    fn grow(&self, amount: usize) {
        let mut workers = lock(&self.workers);
        self.grow_locked(&mut workers, amount);
    }

    fn grow_locked(&self, workers: &mut Vec<WorkerHandle>, amount: usize) {
        if self.stopping.load(Ordering::SeqCst) {
            debug!(requested = amount, "pool is stopping; not growing");
            return;
        }
        for _ in 0..amount {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let worker = Worker::new(
                id,
                self.queue.clone(),
                self.wait_queue.clone(),
                Arc::clone(&self.app),
                Arc::clone(&self.config),
            )
            .with_capacity_hint(Arc::new(PoolHint(self.this.clone())));
            workers.push(worker.spawn());
        }
        if amount > 0 {
            debug!(added = amount, total = workers.len(), "grew worker pool");
        }
    }

    fn worker_count(&self) -> usize {
        let mut workers = lock(&self.workers);
        workers.retain(|worker| !worker.is_finished());
        workers.len()
    }

    /// Grows by `min(backlog, max_workers - live)` while connections are waiting.
    ///
    /// Ignored once the pool is stopping: the backlog then counts shutdown
    /// sentinels, and any worker spawned now would steal one of them.
    fn capacity_hint(&self) {
        let mut workers = lock(&self.workers);
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        workers.retain(|worker| !worker.is_finished());

        let live = workers.len();
        let backlog = self.queue.backlog();
        let max = self.config.max_workers;
        if backlog > 0 && live < max {
            let amount = backlog.min(max - live);
            debug!(backlog, live, amount, "backlog detected; growing pool");
            self.grow_locked(&mut workers, amount);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
