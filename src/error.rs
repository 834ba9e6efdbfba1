//! Failure taxonomy shared by the request-serving core.
//!
//! Every failure a cycle can hit is classified into one [`Error`] variant so the
//! session can decide between re-queueing the connection, answering with a
//! 4xx/5xx, or closing the socket.

use std::io;

use thiserror::Error;

use crate::server::queue::QueueEntry;

/// Any failure raised by an [`Application`](crate::app::Application).
pub type AppError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced while serving a single request/response cycle.
#[derive(Debug, Error)]
pub enum Error {
    /// The request line did not split into `method SP target SP protocol`.
    #[error("malformed request line: {line:?}")]
    MalformedRequest { line: String },

    /// The peer closed the connection before sending a request.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// No request arrived within the read timeout on an idle connection.
    #[error("socket timed out awaiting a request")]
    SocketTimeout,

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// `start_response` was called twice in one cycle before any output.
    #[error("response headers already declared for this cycle")]
    HeadersAlreadyDeclared,

    #[error("application error: {0}")]
    Application(#[source] AppError),
}

impl Error {
    /// Classifies a failure handed back by an application.
    ///
    /// I/O and session errors the application propagated with `?` keep their
    /// own variant, so a peer reset seen through the request body is still a
    /// transport failure. Anything else is [`Error::Application`].
    pub fn from_app(cause: AppError) -> Self {
        let cause = match cause.downcast::<Error>() {
            Ok(err) => return *err,
            Err(cause) => cause,
        };
        match cause.downcast::<io::Error>() {
            Ok(err) => Self::Transport(*err),
            Err(cause) => Self::Application(cause),
        }
    }

    /// Returns `true` for transport failures that only mean the peer went away.
    ///
    /// These are closed quietly instead of being logged as server faults.
    pub fn is_benign_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Transport(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Errors returned when pushing onto a [`WorkQueue`](crate::server::queue::WorkQueue).
///
/// The rejected entry is handed back so the caller can close or retry it.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("work queue is full")]
    Full(QueueEntry),

    #[error("work queue is closed")]
    Closed(QueueEntry),
}

impl QueueError {
    /// Recovers the entry that could not be queued.
    pub fn into_entry(self) -> QueueEntry {
        match self {
            Self::Full(entry) | Self::Closed(entry) => entry,
        }
    }
}

/// Errors produced while loading or validating a [`ServerConfig`](crate::config::ServerConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("min_workers ({min}) exceeds max_workers ({max})")]
    WorkerBounds { min: usize, max: usize },
}
