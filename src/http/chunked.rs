//! Chunked transfer-coding (RFC 9112 §7.1).
//!
//! The decoder is lenient: a chunk-size line that does not parse
//! as hexadecimal ends the stream instead of failing it, and trailer fields
//! after the last chunk are never consumed.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncBufReadExt;

use super::request::{Input, with_timeout};

/// Terminates a chunked response body.
///
/// No empty trailer line follows it; the connection is closed after a
/// synthesized chunked response, so nothing else needs to be delimited.
pub const LAST_CHUNK: &[u8] = b"0\r\n";

/// Frames one body section as `<hex-length>\r\n<bytes>\r\n`.
///
/// Returns `None` for an empty section, which would otherwise read as the
/// terminating chunk.
///
/// ```
/// use hearth::http::chunked::encode_chunk;
///
/// assert_eq!(&encode_chunk(b"hello world").unwrap()[..], b"b\r\nhello world\r\n");
/// assert!(encode_chunk(b"").is_none());
/// ```
pub fn encode_chunk(data: &[u8]) -> Option<Bytes> {
    if data.is_empty() {
        return None;
    }
    let size_line = format!("{:x}\r\n", data.len());
    let mut buf = BytesMut::with_capacity(size_line.len() + data.len() + 2);
    buf.put(size_line.as_bytes());
    buf.put(data);
    buf.put(&b"\r\n"[..]);
    Some(buf.freeze())
}

/// Decodes a chunked request body into a flat byte stream.
///
/// Reads pull across chunk boundaries transparently and return fewer bytes
/// than requested (eventually zero) once the terminating chunk is reached.
pub struct ChunkedReader<'r> {
    inner: &'r mut Input<'r>,
    remaining: u64,
    finished: bool,
    timeout: Duration,
}

impl<'r> ChunkedReader<'r> {
    pub fn new(inner: &'r mut Input<'r>, timeout: Duration) -> Self {
        Self {
            inner,
            remaining: 0,
            finished: false,
            timeout,
        }
    }

    /// Returns `true` once the zero-size chunk has been read.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Reads up to `n` decoded bytes.
    ///
    /// # Errors
    ///
    /// Fails with [`std::io::ErrorKind::UnexpectedEof`] if the stream ends in
    /// the middle of a chunk, or `TimedOut` if the peer stalls.
    pub async fn read(&mut self, n: usize) -> std::io::Result<Bytes> {
        let mut out = BytesMut::with_capacity(n.min(8 * 1024));
        while out.len() < n {
            if self.remaining == 0 {
                if self.finished {
                    break;
                }
                self.next_chunk().await?;
                if self.finished {
                    break;
                }
            }

            let available = with_timeout(self.timeout, self.inner.fill_buf()).await?;
            if available.is_empty() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "chunked body truncated",
                ));
            }

            let take = available
                .len()
                .min(n - out.len())
                .min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
            out.put(&available[..take]);
            self.inner.consume(take);
            self.remaining -= take as u64;

            if self.remaining == 0 {
                self.skip_line().await?;
            }
        }
        Ok(out.freeze())
    }

    /// Reads one decoded line, including its trailing `\n` if present.
    pub async fn read_line(&mut self) -> std::io::Result<Bytes> {
        let mut line = BytesMut::new();
        loop {
            let byte = self.read(1).await?;
            if byte.is_empty() {
                break;
            }
            line.put(&byte[..]);
            if byte[0] == b'\n' {
                break;
            }
        }
        Ok(line.freeze())
    }

    /// Reads the remaining decoded body.
    pub async fn read_to_end(&mut self) -> std::io::Result<Bytes> {
        let mut body = BytesMut::new();
        loop {
            let part = self.read(8 * 1024).await?;
            if part.is_empty() {
                return Ok(body.freeze());
            }
            body.put(part);
        }
    }

    async fn next_chunk(&mut self) -> std::io::Result<()> {
        let mut line = Vec::new();
        let n = with_timeout(self.timeout, self.inner.read_until(b'\n', &mut line)).await?;
        self.remaining = if n == 0 { 0 } else { parse_chunk_size(&line) };
        if self.remaining == 0 {
            self.finished = true;
        }
        Ok(())
    }

    /// Consumes the CRLF that follows each chunk's data.
    async fn skip_line(&mut self) -> std::io::Result<()> {
        let mut line = Vec::new();
        with_timeout(self.timeout, self.inner.read_until(b'\n', &mut line)).await?;
        Ok(())
    }
}

/// Parses a chunk-size line, ignoring extensions after `;`.
///
/// Anything unparseable yields zero, which ends the stream.
fn parse_chunk_size(line: &[u8]) -> u64 {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |pos| pos + 1);
    if start >= end {
        return 0;
    }

    // httparse wants the CRLF; normalize bare-LF and padded lines first.
    let mut normalized = Vec::with_capacity(end - start + 2);
    normalized.extend_from_slice(&line[start..end]);
    normalized.extend_from_slice(b"\r\n");

    match httparse::parse_chunk_size(&normalized) {
        Ok(httparse::Status::Complete((_, size))) => size,
        _ => 0,
    }
}
