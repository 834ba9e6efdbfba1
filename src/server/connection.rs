use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use super::session::{ConnectionSession, SessionOutcome};
use crate::app::Application;
use crate::config::ServerConfig;

/// An accepted TCP connection with its buffered read side.
///
/// Owned by exactly one worker or queue at a time. Buffered input survives
/// parking, so a connection can move between workers without losing bytes.
#[derive(Debug)]
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer_addr: SocketAddr,
    parked_at: Instant,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY");
        }
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
            peer_addr,
            parked_at: Instant::now(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Serves requests until the connection must close or goes idle.
    pub async fn serve<A: Application>(&mut self, app: &A, config: &ServerConfig) -> SessionOutcome {
        ConnectionSession::new(&mut self.reader, &mut self.writer, self.peer_addr, config)
            .serve(app)
            .await
    }

    /// Shuts down the write side; the socket is released on drop.
    pub async fn close(mut self) {
        if let Err(err) = self.writer.shutdown().await {
            debug!(peer = %self.peer_addr, error = %err, "error while closing connection");
        }
    }

    pub(crate) fn park(&mut self) {
        self.parked_at = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.parked_at.elapsed()
    }

    pub(crate) fn has_buffered_input(&self) -> bool {
        !self.reader.buffer().is_empty()
    }

    /// Resolves when the peer sent data or closed its side.
    pub(crate) async fn readable(&self) -> io::Result<()> {
        self.reader.get_ref().readable().await
    }
}
