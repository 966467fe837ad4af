//! Line-framed TCP transport.
//!
//! One `Connection` wraps one TCP socket to one appliance service. The
//! command services speak a newline-terminated text protocol; the data
//! services deliver raw bytes. Both framings live here so every byte that
//! arrives is accounted for: text reads retain surplus bytes in the receive
//! buffer for the next call, and raw reads drain that buffer before touching
//! the socket again.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{ChassisError, ChassisResult};

/// I/O abstraction so tests can drive a connection with an in-memory duplex
/// pipe instead of a live socket.
pub trait Link: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Link for T {}

const RECV_CHUNK: usize = 4096;

/// One TCP connection to one appliance service, with line framing on top.
pub struct Connection {
    io: Box<dyn Link>,
    rx: BytesMut,
    peer: String,
    closed: bool,
}

impl Connection {
    /// Connect to `host:port`, bounded by `timeout`.
    pub async fn open(host: &str, port: u16, timeout: Duration) -> ChassisResult<Self> {
        let connect = TcpStream::connect((host, port));
        let stream = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ChassisError::Connection {
                    host: host.to_string(),
                    port,
                    source,
                })
            }
            Err(_) => {
                return Err(ChassisError::Connection {
                    host: host.to_string(),
                    port,
                    source: std::io::Error::from(std::io::ErrorKind::TimedOut),
                })
            }
        };
        // Command traffic is one short line per exchange.
        let _ = stream.set_nodelay(true);
        debug!(host, port, "connected");
        Ok(Self::from_link(Box::new(stream), format!("{host}:{port}")))
    }

    /// Wrap an already-established link (tests use `tokio::io::duplex`).
    pub fn from_link(io: Box<dyn Link>, peer: impl Into<String>) -> Self {
        Connection {
            io,
            rx: BytesMut::with_capacity(RECV_CHUNK),
            peer: peer.into(),
            closed: false,
        }
    }

    /// Peer label for diagnostics.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write one newline-terminated line.
    pub async fn send(&mut self, text: &str) -> ChassisResult<()> {
        if text.ends_with('\n') {
            self.io.write_all(text.as_bytes()).await?;
        } else {
            let mut line = String::with_capacity(text.len() + 1);
            line.push_str(text);
            line.push('\n');
            self.io.write_all(line.as_bytes()).await?;
        }
        self.io.flush().await?;
        Ok(())
    }

    /// Write raw bytes without framing (waveform payload upload).
    pub async fn send_bytes(&mut self, data: &[u8]) -> ChassisResult<()> {
        self.io.write_all(data).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Block until a full `\n`-terminated line is available and return it
    /// without the terminator (a trailing `\r` is also stripped).
    pub async fn receive_line(&mut self) -> ChassisResult<String> {
        self.receive_until(b'\n').await
    }

    /// Block until `delim` appears in the accumulated receive buffer, return
    /// the text before it, and retain any surplus bytes for the next call.
    pub async fn receive_until(&mut self, delim: u8) -> ChassisResult<String> {
        loop {
            if let Some(pos) = self.rx.iter().position(|&b| b == delim) {
                let mut frame = self.rx.split_to(pos + 1);
                frame.truncate(pos);
                let text = String::from_utf8_lossy(&frame);
                return Ok(text.trim_end_matches('\r').to_string());
            }
            let n = self.io.read_buf(&mut self.rx).await?;
            if n == 0 {
                return Err(ChassisError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{} closed mid-line", self.peer),
                )));
            }
        }
    }

    /// Minimal blocking read passthrough for binary clients.
    ///
    /// Returns at most `max` bytes; an empty buffer signals end of stream.
    /// Any bytes left over from earlier line reads are returned first, so no
    /// byte is ever dropped when a connection switches framing.
    pub async fn recv_raw(&mut self, max: usize) -> ChassisResult<Bytes> {
        if !self.rx.is_empty() {
            let take = self.rx.len().min(max);
            return Ok(self.rx.split_to(take).freeze());
        }
        let mut buf = BytesMut::zeroed(max.min(RECV_CHUNK));
        let n = self.io.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf.freeze())
    }

    /// Half-close the write side (signals end of upload to the device).
    /// Idempotent.
    pub async fn shutdown(&mut self) -> ChassisResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.io.shutdown().await {
            Ok(()) => Ok(()),
            // Already gone on the remote side; close stays idempotent.
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("buffered", &self.rx.len())
            .finish()
    }
}
