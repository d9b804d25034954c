//! Transfer orchestrator.
//!
//! A [`TransferSession`] owns one link for the duration of one transfer and
//! drives the two-phase protocol against it:
//!
//! ```text
//!  send rows [0, B−1] ─► header ─► capture B−1 rows ─► #READY2#
//!      ─► flush stale input ─► #GO2# ─► send rows [B−2, H−1]
//!      ─► capture B−1 rows ─► assemble
//! ```
//!
//! Every wait is bounded, the link is closed on every exit path, and the
//! result is only handed to a [`GridWriter`] once the whole session has
//! succeeded.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;

use bytes::BytesMut;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assembler::{PhaseResult, ResultAssembler};
use crate::codec::RowCodec;
use crate::deadline::{Deadline, poll_until};
use crate::error::{Result, TransferError};
use crate::handshake::{DEFAULT_GO_TOKEN, DEFAULT_READY_TOKEN, send_token, wait_for_token};
use crate::header::{DEFAULT_DIAGNOSTIC_MARKER, FilteredHeader, HeaderParser};
use crate::image::{ImageGrid, PGM_MAGIC};
use crate::link::LinkTransport;
use crate::state::SessionState;
use crate::window::{DEFAULT_BUFFER_ROWS, Phase, PhasePlan, TransferWindow, WindowPlan};

/// Rows between two progress events.
pub const PROGRESS_EVERY: usize = 10;

// ── SessionConfig ────────────────────────────────────────────────

/// Protocol parameters for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Rows the peer can hold at once (`B`).
    pub buffer_rows: usize,
    /// First header line announced by the peer.
    pub magic: String,
    /// Prefix of peer log lines that are skipped.
    pub diagnostic_marker: String,
    /// Device → host token ending phase 1.
    pub ready_token: String,
    /// Host → device token starting phase 2.
    pub go_token: String,
    pub header_timeout: Duration,
    /// Budget for capturing one phase's rows.
    pub capture_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Pause around the go token.
    pub settle_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_rows: DEFAULT_BUFFER_ROWS,
            magic: PGM_MAGIC.to_string(),
            diagnostic_marker: DEFAULT_DIAGNOSTIC_MARKER.to_string(),
            ready_token: DEFAULT_READY_TOKEN.to_string(),
            go_token: DEFAULT_GO_TOKEN.to_string(),
            header_timeout: Duration::from_secs(20),
            capture_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_millis(50),
        }
    }
}

// ── GridWriter ───────────────────────────────────────────────────

/// Destination for a successfully assembled image.
pub trait GridWriter {
    /// Persist `grid`, returning where it went.
    fn write_grid(&mut self, grid: &ImageGrid) -> Result<PathBuf>;
}

impl<F> GridWriter for F
where
    F: FnMut(&ImageGrid) -> Result<PathBuf>,
{
    fn write_grid(&mut self, grid: &ImageGrid) -> Result<PathBuf> {
        self(grid)
    }
}

// ── TransferSession ──────────────────────────────────────────────

/// One transfer over one exclusively owned link. Not reusable.
#[derive(Debug)]
pub struct TransferSession<L> {
    link: L,
    config: SessionConfig,
    state: SessionState,
    cancel: CancellationToken,
}

impl<L: LinkTransport> TransferSession<L> {
    pub fn new(link: L, config: SessionConfig) -> Self {
        Self {
            link,
            config,
            state: SessionState::Init,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort the session when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Give the link back, e.g. to inspect a test double.
    pub fn into_link(self) -> L {
        self.link
    }

    /// Run the full protocol for `image` and return the filtered image.
    ///
    /// On error the session ends in `Failed`; the link is closed either
    /// way.
    pub async fn run(&mut self, image: &ImageGrid) -> Result<ImageGrid> {
        if self.state != SessionState::Init {
            return Err(TransferError::ProtocolViolation(
                "a session can only be run once",
            ));
        }

        let cancel = self.cancel.clone();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            result = self.drive(image) => result,
        };
        self.finish(outcome).await
    }

    /// [`run`](Self::run), aborting with [`TransferError::Cancelled`] as
    /// soon as `cancel` fires.
    pub async fn run_cancellable(
        &mut self,
        image: &ImageGrid,
        cancel: CancellationToken,
    ) -> Result<ImageGrid> {
        self.cancel = cancel;
        self.run(image).await
    }

    /// Run the session and hand the result to `writer`.
    ///
    /// The writer is invoked exactly once, and only after the session
    /// succeeded.
    pub async fn run_and_persist<W: GridWriter + ?Sized>(
        &mut self,
        image: &ImageGrid,
        writer: &mut W,
    ) -> Result<(ImageGrid, PathBuf)> {
        let grid = self.run(image).await?;
        let path = writer.write_grid(&grid)?;
        info!("filtered image saved to {}", path.display());
        Ok((grid, path))
    }

    async fn finish(&mut self, outcome: Result<ImageGrid>) -> Result<ImageGrid> {
        let closed = self.link.close().await;
        match outcome {
            Ok(grid) => {
                if let Err(e) = closed {
                    warn!("closing link after a successful session failed: {e}");
                }
                Ok(grid)
            }
            Err(e) => {
                if !self.state.is_terminal() {
                    self.state.fail()?;
                }
                if let Err(close_err) = closed {
                    debug!("closing link after failure: {close_err}");
                }
                warn!("session {}: {e}", self.state);
                Err(e)
            }
        }
    }

    async fn drive(&mut self, image: &ImageGrid) -> Result<ImageGrid> {
        // Checked before the first byte goes out.
        let plan = WindowPlan::new(self.config.buffer_rows, image.height())?;
        let phase1 = *plan.phase(Phase::One);
        let phase2 = *plan.phase(Phase::Two);
        info!(
            "transferring {}x{} image with a {}-row buffer",
            image.width(),
            image.height(),
            plan.buffer_rows()
        );

        self.state.advance(SessionState::SendPhase1)?;
        self.send_window(image, &phase1).await?;

        self.state.advance(SessionState::AwaitHeader)?;
        let header = self.await_header().await?;
        info!(
            "peer announced {}x{} image, maxval {}",
            header.width, header.height, header.maxval
        );

        self.state.advance(SessionState::CapturePhase1)?;
        let captured1 = self.capture(&phase1, &header).await?;

        self.state.advance(SessionState::AwaitReady)?;
        self.await_ready().await?;

        self.state.advance(SessionState::SendGo)?;
        send_token(&mut self.link, self.config.go_token.as_bytes()).await?;
        tokio::time::sleep(self.config.settle_delay).await;

        self.state.advance(SessionState::SendPhase2)?;
        self.send_window(image, &phase2).await?;

        self.state.advance(SessionState::CapturePhase2)?;
        let captured2 = self.capture(&phase2, &header).await?;

        self.state.advance(SessionState::Assemble)?;
        let grid = ResultAssembler::new(plan.rows_per_phase()).merge(&header, captured1, captured2)?;

        self.state.advance(SessionState::Done)?;
        info!("session complete: {}x{} filtered image", grid.width(), grid.height());
        Ok(grid)
    }

    /// Send the input window of `plan`, one line per row, ascending.
    async fn send_window(&mut self, image: &ImageGrid, plan: &PhasePlan) -> Result<()> {
        let window: TransferWindow = plan.input;
        let mut codec = RowCodec;
        let mut buf = BytesMut::new();
        for (sent, index) in window.rows().enumerate() {
            let row = image.row(index).ok_or(TransferError::ProtocolViolation(
                "input window extends past the image",
            ))?;
            buf.clear();
            codec.encode(row, &mut buf)?;
            self.link.write(&buf).await?;
            if (sent + 1) % PROGRESS_EVERY == 0 {
                debug!("{}: sent {}/{} rows", plan.phase, sent + 1, window.len());
            }
        }
        info!("{}: sent rows {window}", plan.phase);
        Ok(())
    }

    async fn await_header(&mut self) -> Result<FilteredHeader> {
        let timeout = self.config.header_timeout;
        let deadline = Deadline::after(timeout);
        let mut parser = HeaderParser::new(&self.config.magic, &self.config.diagnostic_marker);
        let link = &mut self.link;

        let header = poll_until(deadline, async || {
            let Some(line) = link.read_line(deadline).await? else {
                return Ok(ControlFlow::Continue(()));
            };
            Ok(match parser.feed(&line)? {
                Some(header) => ControlFlow::Break(header),
                None => ControlFlow::Continue(()),
            })
        })
        .await?;

        header.ok_or(TransferError::HeaderTimeout(timeout))
    }

    /// Collect the filtered rows of one phase.
    async fn capture(&mut self, plan: &PhasePlan, header: &FilteredHeader) -> Result<PhaseResult> {
        let expected = plan.expected_rows();
        let deadline = Deadline::after(self.config.capture_timeout);
        let marker = self.config.diagnostic_marker.as_str();
        let link = &mut self.link;
        let mut rows: Vec<Vec<u32>> = Vec::with_capacity(expected);

        let complete = poll_until(deadline, async || {
            let Some(line) = link.read_line(deadline).await? else {
                return Ok(ControlFlow::Continue(()));
            };
            if let Some(row) = header.row_from_line(&line, marker)? {
                rows.push(row);
                if rows.len() % PROGRESS_EVERY == 0 {
                    debug!("{}: captured {}/{expected} rows", plan.phase, rows.len());
                }
            }
            Ok(if rows.len() == expected {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            })
        })
        .await?;

        if complete.is_none() {
            return Err(TransferError::CaptureTimeout {
                stage: plan.phase,
                got: rows.len(),
                expected,
            });
        }
        info!("{}: captured rows {}", plan.phase, plan.output);
        Ok(PhaseResult::new(plan.phase, rows))
    }

    /// Wait for the ready token, then drop anything received before or
    /// with it and let the peer settle.
    async fn await_ready(&mut self) -> Result<()> {
        let timeout = self.config.handshake_timeout;
        let token = self.config.ready_token.as_bytes();
        if !wait_for_token(&mut self.link, token, timeout).await? {
            return Err(TransferError::HandshakeTimeout {
                token: self.config.ready_token.clone(),
                after: timeout,
            });
        }
        info!("peer ready for phase 2");

        let discarded = self.link.reset_input_buffer().await?;
        if discarded > 0 {
            debug!("discarded {discarded} stale bytes after ready token");
        }
        tokio::time::sleep(self.config.settle_delay).await;
        Ok(())
    }
}
