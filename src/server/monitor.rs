//! Watches parked connections and returns them to the workers when they wake.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use super::connection::Connection;
use super::queue::{QueueEntry, WorkQueue};
use crate::config::ServerConfig;

/// Drains the wait-queue.
///
/// Each parked connection is watched until it becomes readable, at which point
/// it goes back onto the active queue, or until it has been idle for
/// [`ServerConfig::idle_timeout`], at which point it is closed.
pub struct Monitor {
    wait_queue: WorkQueue,
    active_queue: WorkQueue,
    config: Arc<ServerConfig>,
}

impl Monitor {
    pub fn new(wait_queue: WorkQueue, active_queue: WorkQueue, config: Arc<ServerConfig>) -> Self {
        Self {
            wait_queue,
            active_queue,
            config,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until a [`QueueEntry::Terminate`] arrives on the wait-queue.
    ///
    /// Connections still being watched at that point are dropped.
    pub async fn run(self) {
        let idle_timeout = self.config.idle_timeout;
        let mut watched = JoinSet::new();

        loop {
            tokio::select! {
                entry = self.wait_queue.pop() => match entry {
                    None | Some(QueueEntry::Terminate) => break,
                    Some(QueueEntry::Ready(connection)) => {
                        watched.spawn(watch(connection, idle_timeout));
                    }
                    Some(entry @ QueueEntry::Accepted { .. }) => self.reactivate(entry).await,
                },
                Some(joined) = watched.join_next(), if !watched.is_empty() => match joined {
                    Ok(Some(connection)) => self.reactivate(QueueEntry::Ready(connection)).await,
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "connection watcher failed"),
                },
            }
        }

        debug!(dropped = watched.len(), "monitor stopped");
        watched.shutdown().await;
    }

    async fn reactivate(&self, entry: QueueEntry) {
        if let Err(err) = self.active_queue.push_wait(entry).await {
            debug!(error = %err, "active queue closed; dropping connection");
            if let QueueEntry::Ready(connection) = err.into_entry() {
                connection.close().await;
            }
        }
    }
}

/// Waits for a parked connection to wake; returns it unless it was closed.
async fn watch(connection: Connection, idle_timeout: Duration) -> Option<Connection> {
    if connection.has_buffered_input() {
        return Some(connection);
    }

    let remaining = idle_timeout.saturating_sub(connection.idle_for());
    let woke = tokio::time::timeout(remaining, connection.readable()).await;
    match woke {
        Ok(Ok(())) => Some(connection),
        Ok(Err(err)) => {
            debug!(peer = %connection.peer_addr(), error = %err, "parked connection failed");
            connection.close().await;
            None
        }
        Err(_) => {
            debug!(peer = %connection.peer_addr(), "flushing idle connection");
            connection.close().await;
            None
        }
    }
}
