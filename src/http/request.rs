//! HTTP/1.1 request-line and header-block parsing.
//!
//! Parsing is line-oriented over a buffered stream so the same reader can be
//! reused for the next request on a persistent connection. The request body is
//! never read here; [`Request`] exposes it as a [`Body`] handle.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::{debug, warn};

use super::chunked::ChunkedReader;
use super::{Headers, Method};
use crate::error::Error;

/// The buffered byte source a request is parsed from.
pub(crate) type Input<'r> = dyn AsyncBufRead + Unpin + Send + 'r;

/// Longest request or header line accepted before the request is rejected.
const MAX_LINE_LEN: u64 = 64 * 1024;

/// Applies the per-connection read timeout to one I/O operation.
pub(crate) async fn with_timeout<T, F>(timeout: Duration, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
    }
}

/// The request line and headers of one request.
///
/// Header names are stored CGI-style: `X-Forwarded-For` becomes
/// `HTTP_X_FORWARDED_FOR`. Use [`header`](Self::header) to look them up by
/// their field name.
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    path: String,
    query_string: String,
    protocol: String,
    scheme: String,
    host: String,
    headers: Headers,
}

impl RequestHead {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The percent-decoded path. Encoded slashes stay as `%2F`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string (without the leading `?`), empty if absent.
    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    /// The protocol token from the request line, e.g. `HTTP/1.1`.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// `http`/`https` from an absolute-form target, otherwise derived from the protocol.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The host from an absolute-form target, falling back to the `Host` header.
    pub fn host(&self) -> &str {
        if self.host.is_empty() {
            self.header("Host").unwrap_or("")
        } else {
            &self.host
        }
    }

    /// Looks up a header by field name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&cgi_key(name))
    }

    /// All headers, keyed CGI-style (`HTTP_*`).
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length")?.trim().parse().ok()
    }

    /// Returns `true` if the body uses the chunked transfer-coding.
    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .is_some_and(|v| has_token(v, "chunked"))
    }

    /// Returns `true` if the client explicitly asked for `Connection: keep-alive`.
    pub fn wants_keep_alive(&self) -> bool {
        self.header("Connection")
            .is_some_and(|v| has_token(v, "keep-alive"))
    }
}

/// Reads one request head (request line and header block) from `input`.
///
/// # Errors
///
/// - [`Error::SocketTimeout`] if no request line arrives within `timeout`.
/// - [`Error::ConnectionClosed`] if the peer closed without sending a request.
/// - [`Error::MalformedRequest`] if the request line is not three tokens.
/// - [`Error::Transport`] for I/O failures inside the header block.
pub async fn read_request_head(
    input: &mut Input<'_>,
    timeout: Duration,
) -> Result<RequestHead, Error> {
    let line = read_request_line(input, timeout).await?;

    let parts: Vec<&str> = line.split(' ').collect();
    let &[method, target, protocol] = parts.as_slice() else {
        return Err(Error::MalformedRequest { line: line.clone() });
    };

    let (scheme, host, target_path) = split_target(target);
    let (raw_path, query_string) = match target_path.split_once('?') {
        Some((path, query)) => (path, query.to_owned()),
        None => (target_path.as_str(), String::new()),
    };

    let scheme = if scheme.is_empty() {
        protocol.split('/').next().unwrap_or("").to_ascii_lowercase()
    } else {
        scheme.to_ascii_lowercase()
    };

    let head = RequestHead {
        method: method.parse().unwrap_or_else(|never| match never {}),
        path: decode_path(raw_path),
        query_string,
        protocol: protocol.to_owned(),
        scheme,
        host,
        headers: read_headers(input, timeout).await?,
    };
    Ok(head)
}

/// Reads the request line, tolerating one empty line before it.
async fn read_request_line(input: &mut Input<'_>, timeout: Duration) -> Result<String, Error> {
    let awaiting = |err: io::Error| match err.kind() {
        io::ErrorKind::TimedOut => Error::SocketTimeout,
        _ => Error::Transport(err),
    };

    let mut line = read_line(input, timeout).await.map_err(awaiting)?;
    if line == b"\r\n" || line == b"\n" {
        debug!("client sent a newline before the request line");
        line = read_line(input, timeout).await.map_err(awaiting)?;
    }

    let text = latin1(&line);
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::ConnectionClosed);
    }
    if line.last() != Some(&b'\n') && line.len() as u64 >= MAX_LINE_LEN {
        return Err(Error::MalformedRequest {
            line: text.chars().take(64).collect(),
        });
    }
    Ok(text.to_owned())
}

/// Reads header lines until the blank line that ends the block.
///
/// Lines starting with a space or tab continue the previous header and are
/// joined with `", "`. Lines that cannot be decoded are dropped with a warning.
async fn read_headers(input: &mut Input<'_>, timeout: Duration) -> Result<Headers, Error> {
    let mut headers = Headers::new();
    let mut previous: Option<String> = None;

    loop {
        let raw = read_line(input, timeout).await?;
        if raw.is_empty() {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside the header block",
            )));
        }
        if raw.last() != Some(&b'\n') && raw.len() as u64 >= MAX_LINE_LEN {
            return Err(Error::MalformedRequest {
                line: latin1(&raw[..64]),
            });
        }

        let line = strip_line_ending(&raw);
        if line.is_empty() {
            return Ok(headers);
        }

        if matches!(line[0], b' ' | b'\t') {
            match &previous {
                Some(key) => {
                    let joined = format!(
                        "{}, {}",
                        headers.get(key).unwrap_or_default(),
                        latin1(line).trim()
                    );
                    headers.set(key.clone(), joined);
                }
                None => warn!(line = %latin1(line), "client sent a continuation line with no header"),
            }
            continue;
        }

        let Some(colon) = line.iter().position(|&b| b == b':') else {
            warn!(line = %latin1(line), "client sent invalid header");
            previous = None;
            continue;
        };

        // Names are US-ASCII; values are Latin-1, which every byte decodes as.
        let Ok(name) = std::str::from_utf8(&line[..colon]) else {
            warn!(line = %latin1(line), "client sent invalid header");
            previous = None;
            continue;
        };
        if !name.is_ascii() || name.trim().is_empty() {
            warn!(line = %latin1(line), "client sent invalid header");
            previous = None;
            continue;
        }

        let key = cgi_key(name);
        headers.set(key.clone(), latin1(&line[colon + 1..]).trim());
        previous = Some(key);
    }
}

async fn read_line(input: &mut Input<'_>, timeout: Duration) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut limited = (&mut *input).take(MAX_LINE_LEN);
    with_timeout(timeout, limited.read_until(b'\n', &mut line)).await?;
    Ok(line)
}

/// Converts a header field name into its CGI key, e.g. `Content-Type` → `HTTP_CONTENT_TYPE`.
pub fn cgi_key(name: &str) -> String {
    format!("HTTP_{}", name.trim().to_ascii_uppercase().replace('-', "_"))
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Splits a request target into `(scheme, host, path-and-query)`.
fn split_target(target: &str) -> (String, String, String) {
    if target == "*" || target.starts_with('/') {
        return (String::new(), String::new(), target.to_owned());
    }
    let Some((scheme, rest)) = target.split_once("://") else {
        return (String::new(), String::new(), String::new());
    };
    let (host, path) = match rest.find(|c| c == '/' || c == '?') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, ""),
    };
    let path = if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    };
    (scheme.to_owned(), host.to_owned(), path)
}

/// Percent-decodes a path while keeping `%2F` literal.
///
/// Decoding an encoded slash would make it indistinguishable from a path
/// separator, so the path is split on `%2F` (any case), each piece is decoded,
/// and the pieces are rejoined with `%2F`.
fn decode_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = find_encoded_slash(rest) {
        out.push_str(&percent_decode(&rest[..pos]));
        out.push_str("%2F");
        rest = &rest[pos + 3..];
    }
    out.push_str(&percent_decode(rest));
    out
}

fn find_encoded_slash(s: &str) -> Option<usize> {
    s.as_bytes()
        .windows(3)
        .position(|w| w[0] == b'%' && w[1] == b'2' && w[2].eq_ignore_ascii_case(&b'f'))
}

/// Decodes `%XX` escapes. Invalid sequences are left as-is.
fn percent_decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// A request body that is not chunked.
///
/// Reads are bounded by `Content-Length`; without one the body is empty.
pub struct RawBody<'r> {
    inner: &'r mut Input<'r>,
    remaining: u64,
    timeout: Duration,
}

impl RawBody<'_> {
    /// Reads up to `n` body bytes; an empty result means the body is exhausted.
    pub async fn read(&mut self, n: usize) -> io::Result<Bytes> {
        let mut out = BytesMut::with_capacity(n.min(8 * 1024));
        while out.len() < n && self.remaining > 0 {
            let available = with_timeout(self.timeout, self.inner.fill_buf()).await?;
            if available.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "request body shorter than Content-Length",
                ));
            }
            let take = available
                .len()
                .min(n - out.len())
                .min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
            out.put(&available[..take]);
            self.inner.consume(take);
            self.remaining -= take as u64;
        }
        Ok(out.freeze())
    }

    pub async fn read_line(&mut self) -> io::Result<Bytes> {
        let mut line = BytesMut::new();
        while self.remaining > 0 {
            let available = with_timeout(self.timeout, self.inner.fill_buf()).await?;
            if available.is_empty() {
                break;
            }
            let limit = available
                .len()
                .min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
            let (take, done) = match available[..limit].iter().position(|&b| b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (limit, false),
            };
            line.put(&available[..take]);
            self.inner.consume(take);
            self.remaining -= take as u64;
            if done {
                break;
            }
        }
        Ok(line.freeze())
    }
}

/// The body-reading handle handed to the application.
pub enum Body<'r> {
    Raw(RawBody<'r>),
    Chunked(ChunkedReader<'r>),
}

impl Body<'_> {
    /// Reads up to `n` bytes of the (decoded) body.
    pub async fn read(&mut self, n: usize) -> io::Result<Bytes> {
        match self {
            Self::Raw(body) => body.read(n).await,
            Self::Chunked(body) => body.read(n).await,
        }
    }

    /// Reads one line of the body, including its trailing `\n` if present.
    pub async fn read_line(&mut self) -> io::Result<Bytes> {
        match self {
            Self::Raw(body) => body.read_line().await,
            Self::Chunked(body) => body.read_line().await,
        }
    }

    pub async fn read_to_end(&mut self) -> io::Result<Bytes> {
        let mut body = BytesMut::new();
        loop {
            let part = self.read(8 * 1024).await?;
            if part.is_empty() {
                return Ok(body.freeze());
            }
            body.put(part);
        }
    }

    /// Reads and drops whatever the application left unread.
    pub(crate) async fn discard(&mut self) -> io::Result<u64> {
        let mut dropped = 0;
        loop {
            let part = self.read(8 * 1024).await?;
            if part.is_empty() {
                return Ok(dropped);
            }
            dropped += part.len() as u64;
        }
    }
}

/// A parsed request together with its peer address and body handle.
pub struct Request<'r> {
    head: RequestHead,
    remote_addr: SocketAddr,
    body: Body<'r>,
}

impl<'r> Request<'r> {
    /// Binds a parsed head to the stream its body will be read from.
    ///
    /// A `Transfer-Encoding: chunked` request gets a [`ChunkedReader`];
    /// anything else reads raw bytes bounded by `Content-Length`.
    pub fn new(
        head: RequestHead,
        remote_addr: SocketAddr,
        input: &'r mut Input<'r>,
        timeout: Duration,
    ) -> Self {
        let body = if head.is_chunked() {
            Body::Chunked(ChunkedReader::new(input, timeout))
        } else {
            Body::Raw(RawBody {
                inner: input,
                remaining: head.content_length().unwrap_or(0),
                timeout,
            })
        };
        Self {
            head,
            remote_addr,
            body,
        }
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn method(&self) -> &Method {
        self.head.method()
    }

    pub fn path(&self) -> &str {
        self.head.path()
    }

    pub fn query_string(&self) -> &str {
        self.head.query_string()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.header(name)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn body(&mut self) -> &mut Body<'r> {
        &mut self.body
    }

    /// Builds the CGI-style environment for this request.
    ///
    /// ```text
    /// REQUEST_METHOD  PATH_INFO  QUERY_STRING  SERVER_PROTOCOL  SCRIPT_NAME
    /// SERVER_NAME  REMOTE_ADDR  REMOTE_PORT  REQUEST_SCHEME
    /// CONTENT_LENGTH  CONTENT_TYPE  HTTP_*
    /// ```
    pub fn environ(&self) -> BTreeMap<String, String> {
        let head = &self.head;
        let mut env = BTreeMap::new();
        env.insert("REQUEST_METHOD".to_owned(), head.method().to_string());
        env.insert("SCRIPT_NAME".to_owned(), String::new());
        env.insert("PATH_INFO".to_owned(), head.path().to_owned());
        env.insert("QUERY_STRING".to_owned(), head.query_string().to_owned());
        env.insert("SERVER_PROTOCOL".to_owned(), head.protocol().to_owned());
        env.insert("REQUEST_SCHEME".to_owned(), head.scheme().to_owned());
        env.insert("REMOTE_ADDR".to_owned(), self.remote_addr.ip().to_string());
        env.insert("REMOTE_PORT".to_owned(), self.remote_addr.port().to_string());

        let host = head.host();
        let server_name = host.rsplit_once(':').map_or(host, |(name, _)| name);
        env.insert("SERVER_NAME".to_owned(), server_name.to_owned());

        if let Some(length) = head.header("Content-Length") {
            env.insert("CONTENT_LENGTH".to_owned(), length.to_owned());
        }
        if let Some(content_type) = head.header("Content-Type") {
            env.insert("CONTENT_TYPE".to_owned(), content_type.to_owned());
        }
        for (key, value) in head.headers().iter() {
            env.insert(key.to_owned(), value.to_owned());
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    const TIMEOUT: Duration = Duration::from_secs(1);

    async fn parse(raw: &[u8]) -> Result<RequestHead, Error> {
        let mut input = BufReader::new(raw);
        read_request_head(&mut input, TIMEOUT).await
    }

    fn peer() -> SocketAddr {
        "192.0.2.7:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn parse_simple_get() {
        let head = parse(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
        assert_eq!(head.method(), &Method::Get);
        assert_eq!(head.path(), "/");
        assert_eq!(head.protocol(), "HTTP/1.1");
        assert_eq!(head.scheme(), "http");
        assert_eq!(head.host(), "localhost");
        assert_eq!(head.header("host"), Some("localhost"));
        assert_eq!(head.headers().get("HTTP_HOST"), Some("localhost"));
    }

    #[tokio::test]
    async fn encoded_slash_is_preserved() {
        let head = parse(b"GET /a%2Fb?x=1 HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(head.path(), "/a%2Fb");
        assert_eq!(head.query_string(), "x=1");
    }

    #[tokio::test]
    async fn rest_of_path_is_decoded() {
        let head = parse(b"GET /caf%C3%A9/x%2fy%20z HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(head.path(), "/café/x%2Fy z");
    }

    #[tokio::test]
    async fn trailing_and_invalid_escapes() {
        let head = parse(b"GET /100%25/%zz/%4 HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(head.path(), "/100%/%zz/%4");
        let head = parse(b"GET /end%41 HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(head.path(), "/endA");
    }

    #[tokio::test]
    async fn absolute_target_splits_host() {
        let head = parse(b"GET HTTPS://example.com:8443/p/q?k=v HTTP/1.1\r\nHost: other\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(head.scheme(), "https");
        assert_eq!(head.host(), "example.com:8443");
        assert_eq!(head.path(), "/p/q");
        assert_eq!(head.query_string(), "k=v");
    }

    #[tokio::test]
    async fn absolute_target_without_path() {
        let head = parse(b"GET http://example.com HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(head.host(), "example.com");
        assert_eq!(head.path(), "/");
    }

    #[tokio::test]
    async fn asterisk_target() {
        let head = parse(b"OPTIONS * HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(head.path(), "*");
    }

    #[tokio::test]
    async fn continuation_lines_are_folded() {
        let head = parse(b"GET / HTTP/1.1\r\nX-Foo: bar\r\n baz\r\n\tqux\r\nX-Other: 1\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(head.header("X-Foo"), Some("bar, baz, qux"));
        assert_eq!(head.header("x-other"), Some("1"));
    }

    #[tokio::test]
    async fn leading_newline_is_tolerated() {
        let head = parse(b"\r\nGET /ok HTTP/1.0\r\n\r\n").await.unwrap();
        assert_eq!(head.path(), "/ok");
    }

    #[tokio::test]
    async fn empty_stream_is_connection_closed() {
        assert!(matches!(parse(b"").await, Err(Error::ConnectionClosed)));
        assert!(matches!(parse(b"\r\n\r\n").await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn two_token_request_line_is_malformed() {
        let err = parse(b"GET /\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, Error::MalformedRequest { ref line } if line == "GET /"));
    }

    #[tokio::test]
    async fn invalid_header_name_is_dropped() {
        let head = parse(b"GET / HTTP/1.1\r\nX-\xffBad: 1\r\nX-Good: 2\r\nnocolon\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(head.headers().len(), 1);
        assert_eq!(head.header("X-Good"), Some("2"));
    }

    #[tokio::test]
    async fn latin1_values_are_kept() {
        let head = parse(b"GET / HTTP/1.1\r\nX-Name: caf\xe9\r\n\r\n").await.unwrap();
        assert_eq!(head.header("X-Name"), Some("café"));
    }

    #[tokio::test]
    async fn eof_inside_headers_is_transport_error() {
        let err = parse(b"GET / HTTP/1.1\r\nHost: x\r\n").await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(err.is_benign_disconnect());
    }

    #[tokio::test]
    async fn keep_alive_and_chunked_flags() {
        let head = parse(
            b"POST / HTTP/1.1\r\nConnection: Keep-Alive\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .await
        .unwrap();
        assert!(head.wants_keep_alive());
        assert!(head.is_chunked());

        let head = parse(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert!(!head.wants_keep_alive());
    }

    #[tokio::test]
    async fn raw_body_is_bounded_by_content_length() {
        let mut input =
            BufReader::new(&b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET / HTTP/1.1\r\n"[..]);
        let head = read_request_head(&mut input, TIMEOUT).await.unwrap();
        let mut request = Request::new(head, peer(), &mut input, TIMEOUT);

        assert_eq!(&request.body().read(100).await.unwrap()[..], b"hello");
        assert!(request.body().read(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunked_body_is_decoded() {
        let mut input = BufReader::new(
            &b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nab\nc\r\n0\r\n"[..],
        );
        let head = read_request_head(&mut input, TIMEOUT).await.unwrap();
        let mut request = Request::new(head, peer(), &mut input, TIMEOUT);

        assert!(matches!(request.body(), Body::Chunked(_)));
        assert_eq!(&request.body().read_line().await.unwrap()[..], b"ab\n");
        assert_eq!(&request.body().read_to_end().await.unwrap()[..], b"c");
    }

    #[tokio::test]
    async fn environ_has_cgi_variables() {
        let mut input = BufReader::new(
            &b"PUT /x?y=1 HTTP/1.1\r\nHost: example.org:8080\r\nContent-Type: text/plain\r\nContent-Length: 0\r\n\r\n"[..],
        );
        let head = read_request_head(&mut input, TIMEOUT).await.unwrap();
        let request = Request::new(head, peer(), &mut input, TIMEOUT);
        let env = request.environ();

        assert_eq!(env["REQUEST_METHOD"], "PUT");
        assert_eq!(env["PATH_INFO"], "/x");
        assert_eq!(env["QUERY_STRING"], "y=1");
        assert_eq!(env["SERVER_NAME"], "example.org");
        assert_eq!(env["REMOTE_ADDR"], "192.0.2.7");
        assert_eq!(env["CONTENT_TYPE"], "text/plain");
        assert_eq!(env["HTTP_CONTENT_LENGTH"], "0");
        assert_eq!(env["REQUEST_SCHEME"], "http");
    }

    #[test]
    fn cgi_keys() {
        assert_eq!(cgi_key("X-Forwarded-For"), "HTTP_X_FORWARDED_FOR");
        assert_eq!(cgi_key(" host "), "HTTP_HOST");
    }
}
