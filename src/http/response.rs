//! HTTP/1.1 response framing.
//!
//! A [`ResponseFramer`] lives for exactly one request/response cycle. The
//! application declares its status and headers through it, and the first body
//! output freezes them: at that point the framer decides between
//! `Content-Length` and chunked framing, negotiates connection persistence,
//! and transmits the status line and header block.

use std::io;
use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use super::chunked::{LAST_CHUNK, encode_chunk};
use super::request::RequestHead;
use super::{Headers, Method, StatusCode};
use crate::error::{AppError, Error};

const HTTP_VERSION: &str = "HTTP/1.1";

/// The byte sink a response is written to.
pub(crate) type Output<'w> = dyn AsyncWrite + Unpin + Send + 'w;

/// Mutable per-cycle response state.
#[derive(Debug, Clone)]
pub struct ResponseState {
    status: StatusCode,
    headers: Headers,
    declared: bool,
    headers_sent: bool,
    chunked: bool,
    close_connection: bool,
    error: Option<(StatusCode, String)>,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: Headers::new(),
            declared: false,
            headers_sent: false,
            chunked: false,
            close_connection: true,
            error: None,
        }
    }
}

impl ResponseState {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Headers in declaration order, including any the framer added.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Whether valid headers were declared for this cycle.
    pub fn declared(&self) -> bool {
        self.declared
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn chunked(&self) -> bool {
        self.chunked
    }

    /// Whether the connection must be closed after this response.
    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    /// The recorded error override, if any.
    pub fn error(&self) -> Option<(StatusCode, &str)> {
        self.error
            .as_ref()
            .map(|(status, message)| (*status, message.as_str()))
    }
}

/// Frames and writes the response for one cycle.
///
/// The application sees this as its start-response handle:
/// [`start_response`](Self::start_response) declares the status and headers,
/// and [`write`](Self::write) sends body bytes directly.
pub struct ResponseFramer<'w> {
    writer: &'w mut Output<'w>,
    server_name: &'w str,
    state: ResponseState,
    head_request: bool,
    client_keep_alive: bool,
    overridden: bool,
}

impl<'w> ResponseFramer<'w> {
    pub fn new(writer: &'w mut Output<'w>, server_name: &'w str, request: &RequestHead) -> Self {
        Self {
            writer,
            server_name,
            state: ResponseState::default(),
            head_request: *request.method() == Method::Head,
            client_keep_alive: request.wants_keep_alive(),
            overridden: false,
        }
    }

    /// Declares the response status and headers.
    ///
    /// Nothing is sent until the first body output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HeadersAlreadyDeclared`] if headers were already
    /// declared but not yet sent this cycle; use
    /// [`start_response_after_error`](Self::start_response_after_error) to
    /// replace them while recovering from an error. Once headers are on the
    /// wire a repeated call is ignored.
    pub fn start_response<I, N, V>(&mut self, status: StatusCode, headers: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: AsRef<str>,
    {
        if self.state.headers_sent {
            debug!(status = %status, "ignoring start_response after headers were sent");
            return Ok(());
        }
        if self.state.declared {
            return Err(Error::HeadersAlreadyDeclared);
        }
        self.declare(status, headers);
        Ok(())
    }

    /// Replaces the declared status and headers after the application hit `cause`.
    ///
    /// # Errors
    ///
    /// Once headers are on the wire they can no longer change, so `cause` is
    /// handed back as [`Error::Application`].
    pub fn start_response_after_error<I, N, V>(
        &mut self,
        status: StatusCode,
        headers: I,
        cause: AppError,
    ) -> Result<(), Error>
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: AsRef<str>,
    {
        if self.state.headers_sent {
            return Err(Error::Application(cause));
        }
        debug!(error = %cause, status = %status, "application replaced its response headers");
        self.declare(status, headers);
        Ok(())
    }

    /// Writes body bytes directly, outside the returned section sequence.
    ///
    /// The total section count is unknown on this path, so without a declared
    /// `Content-Length` the response is sent chunked.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<(), Error> {
        trace!("application wrote to the response directly");
        self.write_section(data.into(), None).await
    }

    pub fn headers_sent(&self) -> bool {
        self.state.headers_sent
    }

    pub fn close_connection(&self) -> bool {
        self.state.close_connection
    }

    pub fn state(&self) -> &ResponseState {
        &self.state
    }

    /// Writes one body section; `sections` is the total count when known.
    pub(crate) async fn write_section(
        &mut self,
        data: Bytes,
        sections: Option<usize>,
    ) -> Result<(), Error> {
        if self.overridden {
            return Ok(());
        }

        let mut data = data;
        let mut sections = sections;
        if !self.state.headers_sent {
            if !self.state.declared && self.state.error.is_none() {
                self.state.error = Some((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "application produced output before declaring headers".to_owned(),
                ));
            }
            if let Some((status, message)) = self.state.error.clone() {
                warn!(status = %status, reason = %message, "overriding response with error");
                self.state.status = status;
                self.state.headers.remove("Content-Length");
                self.state.headers.remove("Transfer-Encoding");
                data = Bytes::from(message);
                sections = Some(1);
                self.overridden = true;
            }
            self.send_headers(data.len(), sections).await?;
        }

        if self.head_request {
            return Ok(());
        }
        if self.state.chunked {
            if let Some(chunk) = encode_chunk(&data) {
                self.send(&chunk).await?;
            }
        } else if !data.is_empty() {
            self.send(&data).await?;
        }
        Ok(())
    }

    /// Completes the cycle: sends headers if nothing was written, then the last chunk.
    pub(crate) async fn finish(&mut self) -> Result<(), Error> {
        if !self.state.headers_sent {
            self.write_section(Bytes::new(), Some(1)).await?;
        }
        if self.state.chunked && !self.head_request {
            self.send(LAST_CHUNK).await?;
        }
        Ok(())
    }

    fn declare<I, N, V>(&mut self, status: StatusCode, headers: I)
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: AsRef<str>,
    {
        let mut declared = Headers::new();
        for (name, value) in headers {
            let (name, value) = (name.as_ref().trim(), value.as_ref().trim());
            if !is_token(name) || !is_latin1_text(value) {
                warn!(header = %name, "application sent a header that is not latin-1 text");
                self.state.error = Some((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "response headers must be latin-1 text".to_owned(),
                ));
                // Left undeclared so the application may try again.
                return;
            }
            declared.insert(name, value);
        }
        self.state.status = status;
        self.state.headers = declared;
        self.state.declared = true;
    }

    async fn send_headers(&mut self, body_len: usize, sections: Option<usize>) -> Result<(), Error> {
        let headers = &mut self.state.headers;

        let transfer_encoding = headers.get_token("Transfer-Encoding");
        let declared_framing = transfer_encoding.is_some() || headers.contains("Content-Length");
        let declared_chunked = transfer_encoding
            .as_deref()
            .is_some_and(|te| te.split(',').any(|coding| coding.trim() == "chunked"));
        self.state.chunked = declared_chunked;

        if !headers.contains("Date") {
            headers.insert("Date", httpdate::fmt_http_date(SystemTime::now()));
        }
        if !headers.contains("Server") {
            headers.insert("Server", self.server_name);
        }

        if !declared_framing {
            if sections == Some(1) {
                headers.insert("Content-Length", body_len.to_string());
            } else {
                debug!("multiple or unknown sections; sending chunked");
                headers.insert("Transfer-Encoding", "chunked");
                self.state.chunked = true;
            }
        }

        let close_delimited = !self.state.chunked && !self.state.headers.contains("Content-Length");
        self.negotiate_persistence(declared_chunked, close_delimited);

        let head = serialize_head(self.state.status, &self.state.headers);
        trace!(head = ?String::from_utf8_lossy(&head), "sending headers");
        self.send(&head).await?;
        self.state.headers_sent = true;
        Ok(())
    }

    /// Decides whether the connection survives this response.
    ///
    /// Persistence requires an explicit `Connection: keep-alive` from the
    /// client, no `Connection: close` from the application, and a body whose
    /// end the client can find. Chunked framing chosen for an unknown length
    /// always closes; chunked framing the application declared itself keeps
    /// the connection only if the application also declared keep-alive.
    fn negotiate_persistence(&mut self, declared_chunked: bool, close_delimited: bool) {
        let headers = &mut self.state.headers;
        let declared = headers.get_token("Connection");
        let app_close = declared.as_deref() == Some("close");
        let app_keep_alive = declared.as_deref() == Some("keep-alive");

        let keep_alive = if app_close || !self.client_keep_alive || close_delimited {
            false
        } else if self.state.chunked {
            declared_chunked && app_keep_alive
        } else {
            true
        };

        if keep_alive {
            if !app_keep_alive {
                let tokens = match headers.get("Connection") {
                    Some(other) => format!("{}, keep-alive", other.trim()),
                    None => "keep-alive".to_owned(),
                };
                headers.set("Connection", tokens);
            }
        } else if !app_close {
            headers.remove("Connection");
            headers.insert("Connection", "close");
        }
        self.state.close_connection = !keep_alive;
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Writes a minimal `text/plain` response that closes the connection.
///
/// Used when a cycle fails before the application's own headers went out.
pub(crate) async fn write_error_response(
    writer: &mut Output<'_>,
    status: StatusCode,
    server_name: &str,
) -> io::Result<()> {
    let body = status.canonical_reason();
    let headers: Headers = [
        ("Content-Length", body.len().to_string()),
        ("Content-Type", "text/plain".to_owned()),
        ("Date", httpdate::fmt_http_date(SystemTime::now())),
        ("Server", server_name.to_owned()),
        ("Connection", "close".to_owned()),
    ]
    .into_iter()
    .collect();

    let mut buf = serialize_head(status, &headers);
    buf.put(body.as_bytes());
    writer.write_all(&buf).await?;
    writer.flush().await
}

fn serialize_head(status: StatusCode, headers: &Headers) -> BytesMut {
    let mut buf = BytesMut::with_capacity(128 + headers.len() * 64);
    buf.put(format!("{HTTP_VERSION} {status}\r\n").as_bytes());
    buf.put(headers.to_string().as_bytes());
    buf.put(&b"\r\n"[..]);
    buf
}

fn is_token(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && !matches!(b, b':' | b'(' | b')' | b'"' | b'/' | b'[' | b']' | b'{' | b'}'))
}

fn is_latin1_text(value: &str) -> bool {
    value
        .chars()
        .all(|c| (c as u32) <= 0xFF && c != '\r' && c != '\n' && c != '\0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::read_request_head;
    use std::time::Duration;
    use tokio::io::BufReader;

    async fn head_of(raw: &[u8]) -> RequestHead {
        let mut input = BufReader::new(raw);
        read_request_head(&mut input, Duration::from_secs(1)).await.unwrap()
    }

    /// Splits a serialized response into its head and body.
    fn split(out: &[u8]) -> (String, Vec<u8>) {
        let pos = out.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        (
            String::from_utf8(out[..pos + 4].to_vec()).unwrap(),
            out[pos + 4..].to_vec(),
        )
    }

    const KEEP_ALIVE_GET: &[u8] = b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";

    #[tokio::test]
    async fn single_section_gets_content_length() {
        let head = head_of(KEEP_ALIVE_GET).await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer.start_response(StatusCode::OK, [("Content-Type", "text/plain")]).unwrap();
        framer.write_section(Bytes::from_static(b"hello"), Some(1)).await.unwrap();
        framer.finish().await.unwrap();
        assert!(!framer.close_connection());
        drop(framer);

        let (head, body) = split(&out);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n"));
        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("Server: test\r\n"));
        assert!(head.contains("Date: "));
        assert!(!head.contains("Transfer-Encoding"));
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn multiple_sections_are_chunked_and_close() {
        let head = head_of(KEEP_ALIVE_GET).await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer.start_response(StatusCode::OK, Vec::<(&str, &str)>::new()).unwrap();
        framer.write_section(Bytes::from_static(b"abc"), Some(2)).await.unwrap();
        framer.write_section(Bytes::from_static(b"0123456789ab"), Some(2)).await.unwrap();
        framer.finish().await.unwrap();
        assert!(framer.close_connection());
        assert!(framer.state().chunked());
        drop(framer);

        let (head, body) = split(&out);
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(!head.contains("Content-Length"));
        assert_eq!(body, b"3\r\nabc\r\nc\r\n0123456789ab\r\n0\r\n");
    }

    #[tokio::test]
    async fn direct_write_is_chunked() {
        let head = head_of(b"GET / HTTP/1.1\r\n\r\n").await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer.start_response(StatusCode::OK, [("X", "1")]).unwrap();
        framer.write("direct").await.unwrap();
        framer.finish().await.unwrap();
        drop(framer);

        let (head, body) = split(&out);
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert_eq!(body, b"6\r\ndirect\r\n0\r\n");
    }

    #[tokio::test]
    async fn head_request_suppresses_body_but_keeps_length() {
        let head = head_of(b"HEAD / HTTP/1.1\r\n\r\n").await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer.start_response(StatusCode::OK, [("Content-Type", "text/html")]).unwrap();
        framer.write_section(Bytes::from_static(b"<h1>hi</h1>"), Some(1)).await.unwrap();
        framer.finish().await.unwrap();
        drop(framer);

        let (head, body) = split(&out);
        assert!(head.contains("Content-Length: 11\r\n"));
        assert_eq!(head.matches("HTTP/1.1 200 OK").count(), 1);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn head_request_chunked_sends_no_terminator() {
        let head = head_of(b"HEAD / HTTP/1.1\r\n\r\n").await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer.start_response(StatusCode::OK, [("A", "b")]).unwrap();
        framer.write_section(Bytes::from_static(b"one"), None).await.unwrap();
        framer.write_section(Bytes::from_static(b"two"), None).await.unwrap();
        framer.finish().await.unwrap();
        drop(framer);

        let (_, body) = split(&out);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn empty_body_gets_zero_length() {
        let head = head_of(KEEP_ALIVE_GET).await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer.start_response(StatusCode::NO_CONTENT, [("X-A", "1")]).unwrap();
        framer.finish().await.unwrap();
        assert!(framer.headers_sent());
        assert!(!framer.close_connection());
        drop(framer);

        let (head, body) = split(&out);
        assert!(head.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(head.contains("Content-Length: 0\r\n"));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn declared_length_is_honoured() {
        let head = head_of(KEEP_ALIVE_GET).await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer.start_response(StatusCode::OK, [("Content-Length", "6")]).unwrap();
        framer.write_section(Bytes::from_static(b"abc"), Some(2)).await.unwrap();
        framer.write_section(Bytes::from_static(b"def"), Some(2)).await.unwrap();
        framer.finish().await.unwrap();
        assert!(!framer.close_connection());
        drop(framer);

        let (head, body) = split(&out);
        assert_eq!(head.matches("Content-Length").count(), 1);
        assert!(!head.contains("Transfer-Encoding"));
        assert_eq!(body, b"abcdef");
    }

    #[tokio::test]
    async fn declared_chunked_with_keep_alive_passes_through() {
        let head = head_of(KEEP_ALIVE_GET).await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer
            .start_response(
                StatusCode::OK,
                [("Transfer-Encoding", "chunked"), ("Connection", "keep-alive")],
            )
            .unwrap();
        framer.write_section(Bytes::from_static(b"x"), None).await.unwrap();
        framer.finish().await.unwrap();
        assert!(!framer.close_connection());
        drop(framer);

        let (head, _) = split(&out);
        assert_eq!(head.matches("Connection:").count(), 1);
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(!head.contains("Connection: close"));
    }

    #[tokio::test]
    async fn synthesized_chunking_drops_declared_keep_alive() {
        let head = head_of(KEEP_ALIVE_GET).await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer.start_response(StatusCode::OK, [("Connection", "keep-alive")]).unwrap();
        framer.write_section(Bytes::from_static(b"x"), None).await.unwrap();
        framer.finish().await.unwrap();
        assert!(framer.close_connection());
        drop(framer);

        let (head, _) = split(&out);
        assert!(head.contains("Connection: close\r\n"));
        assert!(!head.contains("keep-alive"));
    }

    #[tokio::test]
    async fn app_close_is_not_duplicated() {
        let head = head_of(KEEP_ALIVE_GET).await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer.start_response(StatusCode::OK, [("Connection", "close")]).unwrap();
        framer.write_section(Bytes::from_static(b"x"), Some(1)).await.unwrap();
        framer.finish().await.unwrap();
        assert!(framer.close_connection());
        drop(framer);

        let (head, _) = split(&out);
        assert_eq!(head.matches("Connection:").count(), 1);
    }

    #[tokio::test]
    async fn keep_alive_joins_other_connection_tokens() {
        let head = head_of(KEEP_ALIVE_GET).await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer.start_response(StatusCode::OK, [("Connection", "upgrade")]).unwrap();
        framer.write_section(Bytes::from_static(b"x"), Some(1)).await.unwrap();
        assert!(!framer.close_connection());
        drop(framer);

        let (head, _) = split(&out);
        assert_eq!(head.matches("Connection:").count(), 1);
        assert!(head.contains("Connection: upgrade, keep-alive\r\n"));
    }

    #[tokio::test]
    async fn client_without_keep_alive_gets_close() {
        let head = head_of(b"GET / HTTP/1.1\r\n\r\n").await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer.start_response(StatusCode::OK, [("Server", "custom")]).unwrap();
        framer.write_section(Bytes::from_static(b"x"), Some(1)).await.unwrap();
        assert!(framer.close_connection());
        drop(framer);

        let (head, _) = split(&out);
        assert!(head.contains("Connection: close\r\n"));
        assert!(head.contains("Server: custom\r\n"));
        assert!(!head.contains("Server: test"));
    }

    #[tokio::test]
    async fn second_start_response_is_rejected() {
        let head = head_of(KEEP_ALIVE_GET).await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer.start_response(StatusCode::OK, [("A", "1")]).unwrap();
        let err = framer.start_response(StatusCode::OK, [("A", "2")]).unwrap_err();
        assert!(matches!(err, Error::HeadersAlreadyDeclared));
    }

    #[tokio::test]
    async fn start_response_after_output_is_ignored() {
        let head = head_of(KEEP_ALIVE_GET).await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer.start_response(StatusCode::OK, [("A", "1")]).unwrap();
        framer.write_section(Bytes::from_static(b"sent"), Some(1)).await.unwrap();
        framer.start_response(StatusCode::NOT_FOUND, [("A", "2")]).unwrap();
        framer.start_response(StatusCode::NOT_FOUND, [("A", "3")]).unwrap();
        assert_eq!(framer.state().status(), StatusCode::OK);
        drop(framer);

        let (head, body) = split(&out);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\nA: 1\r\n"));
        assert_eq!(body, b"sent");
    }

    #[tokio::test]
    async fn error_recovery_before_output_replaces_headers() {
        let head = head_of(KEEP_ALIVE_GET).await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer.start_response(StatusCode::OK, [("A", "1")]).unwrap();
        framer
            .start_response_after_error(StatusCode::SERVICE_UNAVAILABLE, [("B", "2")], "busy".into())
            .unwrap();
        framer.write_section(Bytes::from_static(b"later"), Some(1)).await.unwrap();
        drop(framer);

        let (head, _) = split(&out);
        assert!(head.starts_with("HTTP/1.1 503 Service Unavailable\r\nB: 2\r\n"));
        assert!(!head.contains("A: 1"));
    }

    #[tokio::test]
    async fn error_recovery_after_output_returns_the_cause() {
        let head = head_of(KEEP_ALIVE_GET).await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer.start_response(StatusCode::OK, [("A", "1")]).unwrap();
        framer.write_section(Bytes::from_static(b"sent"), Some(1)).await.unwrap();
        let err = framer
            .start_response_after_error(StatusCode::INTERNAL_SERVER_ERROR, [("B", "2")], "late".into())
            .unwrap_err();
        assert!(matches!(err, Error::Application(ref cause) if cause.to_string() == "late"));
    }

    #[tokio::test]
    async fn non_latin1_header_overrides_response() {
        let head = head_of(KEEP_ALIVE_GET).await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer
            .start_response(StatusCode::OK, [("X-Emoji", "\u{1F600}"), ("Content-Length", "99")])
            .unwrap();
        framer.write_section(Bytes::from_static(b"first"), Some(3)).await.unwrap();
        framer.write_section(Bytes::from_static(b"second"), Some(3)).await.unwrap();
        framer.finish().await.unwrap();
        assert_eq!(
            framer.state().error(),
            Some((StatusCode::INTERNAL_SERVER_ERROR, "response headers must be latin-1 text"))
        );
        drop(framer);

        let (head, body) = split(&out);
        assert!(head.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(head.contains("Content-Length: 37\r\n"));
        assert_eq!(body, b"response headers must be latin-1 text");
    }

    #[tokio::test]
    async fn invalid_headers_can_be_declared_again() {
        let head = head_of(KEEP_ALIVE_GET).await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer.start_response(StatusCode::OK, [("Bad Name", "x")]).unwrap();
        assert!(!framer.state().declared());

        framer.start_response(StatusCode::OK, [("A", "1")]).unwrap();
        assert!(framer.state().declared());
        let err = framer.start_response(StatusCode::OK, [("A", "2")]).unwrap_err();
        assert!(matches!(err, Error::HeadersAlreadyDeclared));

        // The recorded failure still decides what goes on the wire.
        framer.write_section(Bytes::from_static(b"body"), Some(1)).await.unwrap();
        drop(framer);
        let (head, body) = split(&out);
        assert!(head.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert_eq!(body, b"response headers must be latin-1 text");
    }

    #[tokio::test]
    async fn output_without_declared_headers_is_an_error() {
        let head = head_of(b"GET / HTTP/1.1\r\n\r\n").await;
        let mut out = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, "test", &head);
        framer.write_section(Bytes::from_static(b"oops"), Some(1)).await.unwrap();
        drop(framer);

        let (head, body) = split(&out);
        assert!(head.starts_with("HTTP/1.1 500 "));
        assert_eq!(body, b"application produced output before declaring headers");
    }

    #[tokio::test]
    async fn error_response_is_self_contained() {
        let mut out = Vec::new();
        write_error_response(&mut out, StatusCode::BAD_REQUEST, "test").await.unwrap();

        let (head, body) = split(&out);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(head.contains("Content-Length: 11\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert_eq!(body, b"Bad Request");
    }
}
