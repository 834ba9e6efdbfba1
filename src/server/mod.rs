//! Connection dispatch: the acceptor, the worker pool, and its queues.
//!
//! The [`Server`] accepts TCP connections and pushes each raw socket onto the
//! pool's active [`WorkQueue`]. [`Worker`]s pop entries, wrap raw sockets in a
//! [`Connection`], and drive a [`ConnectionSession`] over it. Connections that
//! go quiet between requests are parked on the wait-queue, where the
//! [`Monitor`] watches them until they speak again or idle out.

pub mod connection;
pub mod monitor;
pub mod pool;
pub mod queue;
pub mod session;
pub mod worker;

use std::future::Future;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub use connection::Connection;
pub use monitor::Monitor;
pub use pool::{CapacityHint, WorkerPool};
pub use queue::{QueueEntry, WorkQueue};
pub use session::{ConnectionSession, SessionOutcome, SessionState};
pub use worker::{Worker, WorkerHandle};

use crate::app::Application;

/// Errors produced by the acceptor.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// The listening socket feeding a [`WorkerPool`].
///
/// # Examples
///
/// ```rust,no_run
/// use hearth::app::{Application, Sections};
/// use hearth::config::ServerConfig;
/// use hearth::error::AppError;
/// use hearth::http::{Request, ResponseFramer, StatusCode};
/// use hearth::server::{Server, WorkerPool};
///
/// struct Hello;
///
/// impl Application for Hello {
///     type Body = Sections;
///
///     async fn call(
///         &self,
///         _request: &mut Request<'_>,
///         response: &mut ResponseFramer<'_>,
///     ) -> Result<Sections, AppError> {
///         response.start_response(StatusCode::OK, [("Content-Type", "text/plain")])?;
///         Ok(Sections::from("Hello!"))
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pool = WorkerPool::start(Hello, ServerConfig::default())?;
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server
///         .run_until(&pool, async {
///             let _ = tokio::signal::ctrl_c().await;
///         })
///         .await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections into `pool` until `shutdown` resolves, then stops the pool.
    ///
    /// Accept failures are logged and skipped; they never end the loop.
    pub async fn run_until<A, F>(self, pool: &WorkerPool<A>, shutdown: F) -> Result<(), ServerError>
    where
        A: Application,
        F: Future<Output = ()>,
    {
        info!(address = %self.local_addr, "hearth listening");
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            debug!(peer = %peer_addr, "connection accepted");
            if let Err(err) = pool
                .queue()
                .push_wait(QueueEntry::Accepted { stream, peer_addr })
                .await
            {
                warn!(peer = %peer_addr, error = %err, "work queue closed; refusing connection");
                break;
            }
        }

        info!(address = %self.local_addr, "shutting down");
        drop(self.listener);
        pool.stop().await;
        Ok(())
    }
}
