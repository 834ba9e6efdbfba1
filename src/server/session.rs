//! The per-connection request/response loop.

use std::net::SocketAddr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};
use tracing::{debug, error, warn};

use crate::app::{Application, ResponseBody};
use crate::config::ServerConfig;
use crate::error::Error;
use crate::http::request::{read_request_head, with_timeout};
use crate::http::response::write_error_response;
use crate::http::{Request, ResponseFramer, StatusCode};

/// Where a session is in its current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingRequest,
    Parsing,
    Invoking,
    Responding,
    Idle,
    Closing,
}

/// What the owner should do with the connection once [`ConnectionSession::serve`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Shut the connection down.
    Close,
    /// No request arrived in time; hand the connection to the wait-queue.
    Park,
}

/// Drives request/response cycles over one connection.
///
/// Cycles are strictly sequential. The session loops while each response
/// negotiates persistence and stops at the first cycle that does not.
pub struct ConnectionSession<'c, R, W> {
    reader: &'c mut R,
    writer: &'c mut W,
    peer_addr: SocketAddr,
    config: &'c ServerConfig,
    state: SessionState,
    headers_sent: bool,
}

impl<'c, R, W> ConnectionSession<'c, R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        reader: &'c mut R,
        writer: &'c mut W,
        peer_addr: SocketAddr,
        config: &'c ServerConfig,
    ) -> Self {
        Self {
            reader,
            writer,
            peer_addr,
            config,
            state: SessionState::AwaitingRequest,
            headers_sent: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serves requests until the connection closes or idles out.
    pub async fn serve<A: Application>(&mut self, app: &A) -> SessionOutcome {
        loop {
            self.state = SessionState::AwaitingRequest;
            self.headers_sent = false;
            match self.serve_request(app).await {
                Ok(true) => self.state = SessionState::Idle,
                Ok(false) => {
                    self.state = SessionState::Closing;
                    return SessionOutcome::Close;
                }
                Err(err) => return self.fail(err).await,
            }
        }
    }

    /// Runs one cycle. Returns whether the connection stays open.
    async fn serve_request<A: Application>(&mut self, app: &A) -> Result<bool, Error> {
        let timeout = self.config.read_timeout;
        match with_timeout(timeout, self.reader.fill_buf()).await {
            Ok(available) if available.is_empty() => return Err(Error::ConnectionClosed),
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                return Err(Error::SocketTimeout);
            }
            Err(err) => return Err(err.into()),
        }

        self.state = SessionState::Parsing;
        let head = read_request_head(&mut *self.reader, timeout).await?;
        debug!(
            peer = %self.peer_addr,
            method = %head.method(),
            path = %head.path(),
            "request received"
        );

        let mut response = ResponseFramer::new(&mut *self.writer, &self.config.server_name, &head);
        let mut request = Request::new(head, self.peer_addr, &mut *self.reader, timeout);

        self.state = SessionState::Invoking;
        let result = match app.call(&mut request, &mut response).await {
            Ok(mut body) => {
                self.state = SessionState::Responding;
                let sent = send_body(&mut response, &mut body).await;
                body.close();
                sent
            }
            Err(cause) => Err(Error::from_app(cause)),
        };
        self.headers_sent = response.headers_sent();
        result?;

        let keep_alive = !response.close_connection();
        if keep_alive {
            let dropped = request.body().discard().await?;
            if dropped > 0 {
                debug!(peer = %self.peer_addr, bytes = dropped, "discarded unread request body");
            }
        }
        Ok(keep_alive)
    }

    async fn fail(&mut self, err: Error) -> SessionOutcome {
        match &err {
            Error::SocketTimeout => {
                debug!(peer = %self.peer_addr, "socket timed out awaiting a request");
                self.state = SessionState::Idle;
                return SessionOutcome::Park;
            }
            Error::ConnectionClosed => {
                debug!(peer = %self.peer_addr, "connection closed by peer");
            }
            Error::MalformedRequest { line } => {
                warn!(peer = %self.peer_addr, line = %line, "malformed request");
                self.reply_with(StatusCode::BAD_REQUEST).await;
            }
            Error::Application(_) | Error::HeadersAlreadyDeclared => {
                error!(peer = %self.peer_addr, error = %err, "application failed");
                if !self.headers_sent {
                    self.reply_with(StatusCode::INTERNAL_SERVER_ERROR).await;
                }
            }
            Error::Transport(_) if err.is_benign_disconnect() => {
                debug!(peer = %self.peer_addr, error = %err, "peer went away");
            }
            Error::Transport(_) => {
                error!(peer = %self.peer_addr, error = %err, "transport failure");
                if !self.headers_sent {
                    self.reply_with(StatusCode::INTERNAL_SERVER_ERROR).await;
                }
            }
        }
        self.state = SessionState::Closing;
        SessionOutcome::Close
    }

    async fn reply_with(&mut self, status: StatusCode) {
        if let Err(err) =
            write_error_response(&mut *self.writer, status, &self.config.server_name).await
        {
            debug!(peer = %self.peer_addr, error = %err, "failed to send error response");
        }
    }
}

async fn send_body<B: ResponseBody>(
    response: &mut ResponseFramer<'_>,
    body: &mut B,
) -> Result<(), Error> {
    let sections = body.section_count();
    while let Some(section) = body.next_section().await {
        let section = section.map_err(Error::from_app)?;
        if section.is_empty() {
            continue;
        }
        response.write_section(section, sections).await?;
    }
    response.finish().await
}
