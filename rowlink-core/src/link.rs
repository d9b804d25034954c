//! The byte link to the peer.
//!
//! [`LinkTransport`] is the capability set the session needs. The one
//! production implementation, [`StreamLink`], wraps any async byte stream:
//! a serial port, a TCP socket, one end of `tokio::io::duplex`, or a
//! scripted `tokio_test::io` mock all go through the same code.

use std::io;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::codec::RowCodec;
use crate::deadline::Deadline;
use crate::error::{Result, TransferError};

/// Bytes requested from the stream per read.
const READ_CHUNK: usize = 4096;

// ── LinkTransport ────────────────────────────────────────────────

/// Half-duplex byte link owned by exactly one session.
///
/// Every read is bounded by a [`Deadline`]; `None` means the deadline
/// passed without the requested data. A peer hang-up is an error, not
/// `None`.
#[async_trait]
pub trait LinkTransport: Send {
    /// Write all of `bytes` and flush.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Next newline-terminated line, trimmed and permissively decoded.
    async fn read_line(&mut self, deadline: Deadline) -> Result<Option<String>>;

    /// Bytes that can be read right now without waiting.
    async fn bytes_available(&mut self) -> Result<usize>;

    /// Next single byte.
    async fn read_byte(&mut self, deadline: Deadline) -> Result<Option<u8>>;

    /// Drop everything buffered or immediately readable. Returns the
    /// number of bytes discarded.
    async fn reset_input_buffer(&mut self) -> Result<usize>;

    /// Release the link. Further use is an error.
    async fn close(&mut self) -> Result<()>;
}

// ── BoxedStream ──────────────────────────────────────────────────

/// Object-safe alias for "any async byte stream".
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased stream, so serial, TCP and simulated endpoints share one
/// concrete link type.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Link over a type-erased stream.
pub type BoxedLink = StreamLink<BoxedStream>;

// ── StreamLink ───────────────────────────────────────────────────

/// [`LinkTransport`] over an async byte stream with an internal receive
/// buffer shared by the line and byte readers.
pub struct StreamLink<S> {
    io: S,
    rx: BytesMut,
    codec: RowCodec,
    closed: bool,
}

impl<S> std::fmt::Debug for StreamLink<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLink")
            .field("buffered", &self.rx.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> StreamLink<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            rx: BytesMut::with_capacity(READ_CHUNK),
            codec: RowCodec,
            closed: false,
        }
    }

    /// Box the stream so links of different origin share one type.
    pub fn boxed(self) -> BoxedLink
    where
        S: 'static,
    {
        StreamLink {
            io: Box::new(self.io),
            rx: self.rx,
            codec: self.codec,
            closed: self.closed,
        }
    }

    /// Bytes currently held in the receive buffer.
    pub fn buffered(&self) -> usize {
        self.rx.len()
    }

    /// Recover the underlying stream.
    pub fn into_inner(self) -> S {
        self.io
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(TransferError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "link already closed",
            )));
        }
        Ok(())
    }

    /// Read at least one more byte into the receive buffer.
    async fn fill(&mut self) -> Result<usize> {
        self.ensure_open()?;
        self.rx.reserve(READ_CHUNK);
        let n = self.io.read_buf(&mut self.rx).await?;
        if n == 0 {
            return Err(TransferError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the link",
            )));
        }
        trace!("link read {n} bytes");
        Ok(n)
    }

    /// `fill` bounded by `deadline`; `Ok(false)` on expiry.
    async fn fill_until(&mut self, deadline: Deadline) -> Result<bool> {
        match deadline.within(self.fill()).await {
            Some(result) => result.map(|_| true),
            None => Ok(false),
        }
    }

    /// `fill` without waiting; `Ok(false)` when nothing is ready.
    fn fill_now(&mut self) -> Result<bool> {
        match self.fill().now_or_never() {
            Some(result) => result.map(|_| true),
            None => Ok(false),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> LinkTransport for StreamLink<S> {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.io.write_all(bytes).await?;
        self.io.flush().await?;
        trace!("link wrote {} bytes", bytes.len());
        Ok(())
    }

    async fn read_line(&mut self, deadline: Deadline) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.codec.decode(&mut self.rx)? {
                return Ok(Some(line));
            }
            if !self.fill_until(deadline).await? {
                return Ok(None);
            }
        }
    }

    async fn bytes_available(&mut self) -> Result<usize> {
        self.fill_now()?;
        Ok(self.rx.len())
    }

    async fn read_byte(&mut self, deadline: Deadline) -> Result<Option<u8>> {
        if self.rx.is_empty() && !self.fill_until(deadline).await? {
            return Ok(None);
        }
        Ok(Some(self.rx.get_u8()))
    }

    async fn reset_input_buffer(&mut self) -> Result<usize> {
        let mut discarded = self.rx.len();
        self.rx.clear();
        while self.fill_now()? {
            discarded += self.rx.len();
            self.rx.clear();
        }
        Ok(discarded)
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.rx.clear();
        match self.io.shutdown().await {
            Ok(()) => Ok(()),
            // The peer may already be gone; closing is still complete.
            Err(e) if e.kind() == io::ErrorKind::NotConnected || e.kind() == io::ErrorKind::BrokenPipe => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
