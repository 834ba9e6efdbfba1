//! The contract between the request-serving core and the application.
//!
//! A worker hands each parsed [`Request`] to [`Application::call`] together
//! with the cycle's [`ResponseFramer`], which doubles as the start-response
//! handle. The application returns a [`ResponseBody`]: a finite sequence of
//! byte sections that the framer writes out, followed by the body's close hook.

use std::collections::VecDeque;
use std::future::Future;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::AppError;
use crate::http::{Request, ResponseFramer};

/// An application invoked once per request/response cycle.
///
/// # Examples
///
/// ```
/// use hearth::app::{Application, Sections};
/// use hearth::error::AppError;
/// use hearth::http::{Request, ResponseFramer, StatusCode};
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
///         Ok(Sections::from("Hello, World!"))
///     }
/// }
/// ```
pub trait Application: Send + Sync + 'static {
    type Body: ResponseBody;

    /// Handles one request.
    ///
    /// The application must call [`ResponseFramer::start_response`] before
    /// any body output. Errors returned here are answered with a
    /// `500 Internal Server Error` when the headers have not been sent yet.
    fn call(
        &self,
        request: &mut Request<'_>,
        response: &mut ResponseFramer<'_>,
    ) -> impl Future<Output = Result<Self::Body, AppError>> + Send;
}

/// The sequence of byte sections an application responds with.
pub trait ResponseBody: Send {
    /// The total number of sections, if known before the first one is produced.
    ///
    /// Exactly one section lets the framer send `Content-Length`; anything
    /// else falls back to chunked framing.
    fn section_count(&self) -> Option<usize> {
        None
    }

    /// Produces the next section, or `None` once the body is exhausted.
    fn next_section(&mut self) -> impl Future<Output = Option<Result<Bytes, AppError>>> + Send;

    /// Called once after the cycle completes, including on error paths.
    fn close(&mut self) {}
}

/// A body whose sections are all known up front.
#[derive(Debug, Clone, Default)]
pub struct Sections {
    sections: VecDeque<Bytes>,
    count: usize,
}

impl Sections {
    pub fn new<I, B>(sections: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let sections: VecDeque<Bytes> = sections.into_iter().map(Into::into).collect();
        let count = sections.len();
        Self { sections, count }
    }

    /// A body with no sections; the response goes out with `Content-Length: 0`.
    pub fn empty() -> Self {
        Self::default()
    }
}

impl From<&'static str> for Sections {
    fn from(body: &'static str) -> Self {
        Self::new([body])
    }
}

impl From<String> for Sections {
    fn from(body: String) -> Self {
        Self::new([body])
    }
}

impl From<Vec<u8>> for Sections {
    fn from(body: Vec<u8>) -> Self {
        Self::new([body])
    }
}

impl ResponseBody for Sections {
    fn section_count(&self) -> Option<usize> {
        Some(self.count)
    }

    async fn next_section(&mut self) -> Option<Result<Bytes, AppError>> {
        self.sections.pop_front().map(Ok)
    }
}

/// A body produced incrementally by another task.
///
/// The section count is unknown, so the response is sent chunked unless the
/// application declared its own framing.
///
/// ```no_run
/// use hearth::app::Streamed;
///
/// let (tx, body) = Streamed::channel(4);
/// tokio::spawn(async move {
///     let _ = tx.send(Ok("part one".into())).await;
///     let _ = tx.send(Ok("part two".into())).await;
/// });
/// # drop(body);
/// ```
#[derive(Debug)]
pub struct Streamed {
    rx: mpsc::Receiver<Result<Bytes, AppError>>,
}

impl Streamed {
    /// Creates a producer handle and the body that drains it.
    pub fn channel(buffer: usize) -> (mpsc::Sender<Result<Bytes, AppError>>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

impl ResponseBody for Streamed {
    async fn next_section(&mut self) -> Option<Result<Bytes, AppError>> {
        self.rx.recv().await
    }

    /// Stops the producer: further sends fail once the body is closed.
    fn close(&mut self) {
        self.rx.close();
    }
}
