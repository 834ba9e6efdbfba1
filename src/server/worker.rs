//! Pool-managed workers that pull connections off the shared queue.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::connection::Connection;
use super::pool::CapacityHint;
use super::queue::{QueueEntry, WorkQueue};
use super::session::SessionOutcome;
use crate::app::Application;
use crate::config::ServerConfig;

/// A single worker task.
///
/// A worker owns at most one connection at a time and serves it until the
/// session closes or parks it. Only a [`QueueEntry::Terminate`] ends the loop;
/// every per-connection failure is handled inside the session.
pub struct Worker<A> {
    id: usize,
    queue: WorkQueue,
    wait_queue: WorkQueue,
    app: Arc<A>,
    config: Arc<ServerConfig>,
    hint: Option<Arc<dyn CapacityHint>>,
    kill: Arc<Notify>,
}

impl<A: Application> Worker<A> {
    pub fn new(
        id: usize,
        queue: WorkQueue,
        wait_queue: WorkQueue,
        app: Arc<A>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            id,
            queue,
            wait_queue,
            app,
            config,
            hint: None,
            kill: Arc::new(Notify::new()),
        }
    }

    /// Notifies `hint` whenever this worker picks up a freshly accepted socket.
    pub fn with_capacity_hint(mut self, hint: Arc<dyn CapacityHint>) -> Self {
        self.hint = Some(hint);
        self
    }

    /// Runs the worker on the tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let id = self.id;
        let kill = Arc::clone(&self.kill);
        let task = tokio::spawn(self.run());
        WorkerHandle { id, kill, task }
    }

    pub async fn run(self) {
        debug!(worker = self.id, "worker started");
        loop {
            let connection = match self.queue.pop().await {
                None | Some(QueueEntry::Terminate) => break,
                Some(QueueEntry::Ready(connection)) => connection,
                Some(QueueEntry::Accepted { stream, peer_addr }) => {
                    if let Some(hint) = &self.hint {
                        hint.capacity_hint();
                    }
                    debug!(worker = self.id, peer = %peer_addr, "received a connection");
                    Connection::new(stream, peer_addr)
                }
            };
            self.serve(connection).await;
        }
        debug!(worker = self.id, "received terminate sentinel; worker exiting");
    }

    async fn serve(&self, mut connection: Connection) {
        let peer = connection.peer_addr();
        let killed = self.kill.notified();
        tokio::pin!(killed);

        let outcome = tokio::select! {
            outcome = connection.serve(&*self.app, &self.config) => Some(outcome),
            () = &mut killed => None,
        };

        match outcome {
            Some(SessionOutcome::Park) => {
                connection.park();
                if let Err(err) = self.wait_queue.push(QueueEntry::Ready(connection)) {
                    warn!(worker = self.id, peer = %peer, error = %err, "wait-queue rejected connection");
                    if let QueueEntry::Ready(connection) = err.into_entry() {
                        connection.close().await;
                    }
                }
            }
            Some(SessionOutcome::Close) => connection.close().await,
            None => {
                warn!(worker = self.id, peer = %peer, "worker killed; dropping connection");
                connection.close().await;
            }
        }
    }
}

/// Control handle for a spawned [`Worker`].
#[derive(Debug)]
pub struct WorkerHandle {
    id: usize,
    kill: Arc<Notify>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Tears down the connection the worker is serving, if any.
    ///
    /// The worker itself keeps running and returns to the queue.
    pub fn kill(&self) {
        self.kill.notify_waiters();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the worker task to exit.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!(worker = self.id, error = %err, "worker task failed");
        }
    }
}
