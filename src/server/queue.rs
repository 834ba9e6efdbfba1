//! The bounded queue connecting the acceptor, the monitor, and the workers.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::{Mutex, mpsc};

use super::connection::Connection;
use crate::error::QueueError;

/// One unit of work for a worker.
#[derive(Debug)]
pub enum QueueEntry {
    /// An established connection, possibly returning from the wait-queue.
    Ready(Connection),

    /// A freshly accepted socket. The worker that dequeues it wraps it in a
    /// [`Connection`] and gives the pool a chance to grow.
    Accepted {
        stream: TcpStream,
        peer_addr: SocketAddr,
    },

    /// Ends the worker (or monitor) that receives it.
    Terminate,
}

/// A multi-producer, multi-consumer bounded queue of [`QueueEntry`] values.
///
/// Cloning yields another handle to the same queue. Consumers take turns on a
/// shared receiver, so each entry is delivered to exactly one of them.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<QueueEntry>,
    rx: Arc<Mutex<mpsc::Receiver<QueueEntry>>>,
}

impl WorkQueue {
    /// Creates a queue holding at most `capacity` entries (minimum one).
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Enqueues without waiting.
    ///
    /// # Errors
    ///
    /// Hands the entry back in [`QueueError::Full`] or [`QueueError::Closed`].
    pub fn push(&self, entry: QueueEntry) -> Result<(), QueueError> {
        self.tx.try_send(entry).map_err(|err| match err {
            TrySendError::Full(entry) => QueueError::Full(entry),
            TrySendError::Closed(entry) => QueueError::Closed(entry),
        })
    }

    /// Enqueues, waiting for free capacity.
    pub async fn push_wait(&self, entry: QueueEntry) -> Result<(), QueueError> {
        self.tx
            .send(entry)
            .await
            .map_err(|SendError(entry)| QueueError::Closed(entry))
    }

    /// Waits for the next entry.
    ///
    /// Returns `None` once the queue is closed and drained; callers treat that
    /// exactly like [`QueueEntry::Terminate`].
    pub async fn pop(&self) -> Option<QueueEntry> {
        self.rx.lock().await.recv().await
    }

    /// Number of entries currently waiting.
    pub fn backlog(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Rejects further pushes. Entries already queued can still be popped.
    pub async fn close(&self) {
        self.rx.lock().await.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_come_out_in_order() {
        let queue = WorkQueue::new(4);
        queue.push(QueueEntry::Terminate).unwrap();
        queue.push_wait(QueueEntry::Terminate).await.unwrap();
        assert_eq!(queue.backlog(), 2);

        assert!(matches!(queue.pop().await, Some(QueueEntry::Terminate)));
        assert!(matches!(queue.pop().await, Some(QueueEntry::Terminate)));
        assert_eq!(queue.backlog(), 0);
    }

    #[tokio::test]
    async fn push_on_full_queue_returns_the_entry() {
        let queue = WorkQueue::new(1);
        queue.push(QueueEntry::Terminate).unwrap();

        let err = queue.push(QueueEntry::Terminate).unwrap_err();
        assert!(matches!(err, QueueError::Full(_)));
        assert!(matches!(err.into_entry(), QueueEntry::Terminate));
    }

    #[tokio::test]
    async fn closed_queue_rejects_pushes_but_drains() {
        let queue = WorkQueue::new(2);
        queue.push(QueueEntry::Terminate).unwrap();
        queue.close().await;

        assert!(matches!(
            queue.push(QueueEntry::Terminate),
            Err(QueueError::Closed(_))
        ));
        assert!(matches!(
            queue.push_wait(QueueEntry::Terminate).await,
            Err(QueueError::Closed(_))
        ));
        assert!(matches!(queue.pop().await, Some(QueueEntry::Terminate)));
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let producer = WorkQueue::new(2);
        let consumer = producer.clone();
        producer.push(QueueEntry::Terminate).unwrap();
        assert!(matches!(consumer.pop().await, Some(QueueEntry::Terminate)));
    }
}
