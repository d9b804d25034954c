//! In-process peer that plays the device side of the protocol with an
//! identity filter. Backs the host's `--simulate` mode and the tests.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Encoder;
use tracing::{debug, info};

use crate::codec::{RowCodec, parse_row};
use crate::deadline::Deadline;
use crate::error::{Result, TransferError};
use crate::handshake::{DEFAULT_GO_TOKEN, DEFAULT_READY_TOKEN};
use crate::image::PGM_MAGIC;
use crate::link::{LinkTransport, StreamLink};
use crate::window::{DEFAULT_BUFFER_ROWS, WindowPlan};

#[derive(Debug, Clone)]
pub struct SimulatedPeer {
    pub buffer_rows: usize,
    /// Maxval announced in the header; echoed values are clamped to it.
    pub maxval: u32,
    /// Diagnostic line emitted before the header and before the ready
    /// token.
    pub chatter: Option<String>,
    pub ready_token: String,
    pub go_token: String,
    /// Longest the peer waits for any single host step.
    pub step_timeout: Duration,
}

impl Default for SimulatedPeer {
    fn default() -> Self {
        Self {
            buffer_rows: DEFAULT_BUFFER_ROWS,
            maxval: 255,
            chatter: None,
            ready_token: DEFAULT_READY_TOKEN.to_string(),
            go_token: DEFAULT_GO_TOKEN.to_string(),
            step_timeout: Duration::from_secs(60),
        }
    }
}

impl SimulatedPeer {
    pub fn new(buffer_rows: usize) -> Self {
        Self {
            buffer_rows,
            ..Self::default()
        }
    }

    pub fn with_chatter(mut self, line: impl Into<String>) -> Self {
        self.chatter = Some(line.into());
        self
    }

    pub fn with_maxval(mut self, maxval: u32) -> Self {
        self.maxval = maxval;
        self
    }

    /// Serve one session on `io`, then close it.
    pub async fn serve<S>(self, io: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut link = StreamLink::new(io);
        let result = self.exchange(&mut link).await;
        link.close().await?;
        result
    }

    async fn exchange<S>(&self, link: &mut StreamLink<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let b = self.buffer_rows;
        let height = WindowPlan::new(b, WindowPlan::required_height(b))?.height();

        let first = self.receive_rows(link).await?;
        let width = first.first().map_or(0, Vec::len);
        debug!("sim: received phase 1 window of {} rows", first.len());

        let mut out = BytesMut::new();
        self.push_chatter(&mut out);
        out.extend_from_slice(format!("{PGM_MAGIC}\n{width} {height}\n{}\n", self.maxval).as_bytes());
        self.push_rows(&mut out, &first[..b - 1])?;
        link.write(&out).await?;

        out.clear();
        self.push_chatter(&mut out);
        out.extend_from_slice(self.ready_token.as_bytes());
        link.write(&out).await?;

        self.await_go(link).await?;
        debug!("sim: go token received");

        let second = self.receive_rows(link).await?;
        out.clear();
        self.push_rows(&mut out, &second[1..])?;
        link.write(&out).await?;
        info!("sim: served {width}x{height} session");
        Ok(())
    }

    async fn receive_rows<S>(&self, link: &mut StreamLink<S>) -> Result<Vec<Vec<u32>>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let deadline = Deadline::after(self.step_timeout);
        let mut rows = Vec::with_capacity(self.buffer_rows);
        while rows.len() < self.buffer_rows {
            let line = link.read_line(deadline).await?.ok_or_else(step_timed_out)?;
            if !line.is_empty() {
                rows.push(parse_row(&line)?);
            }
        }
        Ok(rows)
    }

    async fn await_go<S>(&self, link: &mut StreamLink<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let deadline = Deadline::after(self.step_timeout);
        let token = self.go_token.as_bytes();
        let mut window = VecDeque::with_capacity(token.len());
        while !window.iter().eq(token.iter()) {
            let byte = link.read_byte(deadline).await?.ok_or_else(step_timed_out)?;
            if window.len() == token.len() {
                window.pop_front();
            }
            window.push_back(byte);
        }
        Ok(())
    }

    fn push_chatter(&self, out: &mut BytesMut) {
        if let Some(line) = &self.chatter {
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\n");
        }
    }

    fn push_rows(&self, out: &mut BytesMut, rows: &[Vec<u32>]) -> Result<()> {
        let mut codec = RowCodec;
        for row in rows {
            let clamped: Vec<u32> = row.iter().map(|&v| v.min(self.maxval)).collect();
            codec.encode(clamped.as_slice(), out)?;
        }
        Ok(())
    }
}

fn step_timed_out() -> TransferError {
    TransferError::Transport(io::Error::new(
        io::ErrorKind::TimedOut,
        "simulated peer gave up waiting for the host",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageGrid;
    use crate::session::{SessionConfig, TransferSession};

    #[tokio::test(start_paused = true)]
    async fn identity_round_trip_with_chatter() {
        let rows = (0..4u32).map(|r| vec![r * 10, r * 10 + 1]).collect();
        let image = ImageGrid::new(2, 4, 255, rows).unwrap();

        let (near, far) = tokio::io::duplex(256);
        let peer = tokio::spawn(SimulatedPeer::new(3).with_chatter("ERROR: busy").serve(far));

        let config = SessionConfig {
            buffer_rows: 3,
            ..SessionConfig::default()
        };
        let mut session = TransferSession::new(StreamLink::new(near), config);
        let out = session.run(&image).await.unwrap();
        assert_eq!(out, image);
        peer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn undersized_buffer_is_refused_before_reading() {
        for buffer_rows in [0, 1] {
            let (_near, far) = tokio::io::duplex(64);
            let err = SimulatedPeer::new(buffer_rows).serve(far).await.unwrap_err();
            assert!(matches!(err, TransferError::Configuration(_)));
        }
    }
}
