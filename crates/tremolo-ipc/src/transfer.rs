//! Framed socket transport shared by both sides of the protocol.
//!
//! A frame is the bytes up to and including one NUL terminator. A single
//! socket read may deliver several frames; the codec yields them in
//! arrival order. Once a channel has failed its read budget it is marked
//! disconnected for good - a broken [`Transfer`] is replaced, never
//! healed.

use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, warn};

use crate::error::{IpcError, IpcResult};
use crate::protocol::{self, TERMINATOR};

/// Consecutive read failures after which a channel is abandoned.
pub const READ_FAILURE_LIMIT: u32 = 5;

/// NUL-terminated frame codec.
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = String;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> IpcResult<Option<String>> {
        let Some(pos) = src.iter().position(|b| *b == TERMINATOR) else {
            return Ok(None);
        };
        let frame = src.split_to(pos + 1);
        Ok(Some(String::from_utf8_lossy(&frame[..pos]).into_owned()))
    }
}

impl Encoder<&str> for FrameCodec {
    type Error = IpcError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> IpcResult<()> {
        dst.reserve(item.len() + 1);
        dst.put(item.as_bytes());
        dst.put_u8(TERMINATOR);
        Ok(())
    }
}

/// A framed, bidirectional message channel over one connected socket.
pub struct Transfer {
    framed: Framed<TcpStream, FrameCodec>,
    read_failures: u32,
    connected: bool,
}

impl Transfer {
    /// Wrap a connected socket.
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        Self { framed: Framed::new(stream, FrameCodec), read_failures: 0, connected: true }
    }

    /// Whether the channel is still usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Read the next frame.
    ///
    /// # Errors
    /// Returns an error on a failed or closed read. After
    /// [`READ_FAILURE_LIMIT`] consecutive failures the channel is marked
    /// disconnected and every further call fails fast.
    pub async fn read_message(&mut self) -> IpcResult<String> {
        if !self.connected {
            return Err(IpcError::Disconnected);
        }
        match self.framed.next().await {
            Some(Ok(frame)) => {
                self.read_failures = 0;
                Ok(frame)
            }
            Some(Err(e)) => {
                self.record_read_failure();
                Err(e)
            }
            None => {
                // Peer closed the socket.
                self.record_read_failure();
                Err(IpcError::Disconnected)
            }
        }
    }

    /// Read the next frame with a deadline.
    ///
    /// # Errors
    /// Returns [`IpcError::Timeout`] if the deadline elapses; a timeout
    /// counts toward the read-failure budget like any other failure.
    pub async fn read_message_timeout(&mut self, deadline: Duration) -> IpcResult<String> {
        let result = tokio::time::timeout(deadline, self.read_message()).await;
        match result {
            Ok(inner) => inner,
            Err(_) => {
                self.record_read_failure();
                Err(IpcError::Timeout)
            }
        }
    }

    /// Write one frame with a single send; there is no partial-write
    /// retry.
    ///
    /// # Errors
    /// Any failure is reported immediately and marks the channel
    /// disconnected.
    pub async fn write_message(&mut self, message: &str) -> IpcResult<()> {
        if !self.connected {
            return Err(IpcError::Disconnected);
        }
        if let Err(e) = self.framed.send(message).await {
            warn!(error = %e, "write failed; marking channel disconnected");
            self.connected = false;
            return Err(e);
        }
        Ok(())
    }

    fn record_read_failure(&mut self) {
        self.read_failures += 1;
        if self.read_failures >= READ_FAILURE_LIMIT && self.connected {
            warn!(failures = self.read_failures, "read budget exhausted; channel disconnected");
            self.connected = false;
        }
    }
}

/// One-shot client-side connection helper.
///
/// Opens a socket to the daemon's loopback port and wraps it in a
/// [`Transfer`]. There is no retry here - callers own that policy. The
/// receive deadline is applied per read via
/// [`Transfer::read_message_timeout`].
pub struct Connector;

impl Connector {
    /// Connect to the default daemon port.
    ///
    /// # Errors
    /// Returns an error if the connection fails.
    pub async fn connect() -> IpcResult<Transfer> {
        Self::connect_to(protocol::PORT).await
    }

    /// Connect to a specific loopback port.
    ///
    /// # Errors
    /// Returns an error if the connection fails.
    pub async fn connect_to(port: u16) -> IpcResult<Transfer> {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not disable Nagle on control socket");
        }
        debug!(port, "control socket connected");
        Ok(Transfer::new(stream))
    }
}
