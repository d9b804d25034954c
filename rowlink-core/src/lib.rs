//! # rowlink-core
//!
//! Host side of a two-phase row-transfer protocol for filtering an image on
//! a peer that can only buffer a handful of rows at a time.
//!
//! This crate contains:
//! - **Image**: `ImageGrid` and the PGM `P2` loader and writer
//! - **Windowing**: `WindowPlan`, the overlapping row windows of each phase
//! - **Link**: `LinkTransport` and `StreamLink` over any async byte stream
//! - **Codec**: `RowCodec` line framing for rows on the wire
//! - **Protocol**: header parser, handshake tokens, result assembler
//! - **Session**: `TransferSession`, the orchestrator and its state machine
//! - **Monitor**: passive capture of streamed frames
//! - **Sim**: `SimulatedPeer`, an identity-filter peer for tests and demos
//! - **Error**: `TransferError`, typed with `thiserror`

pub mod assembler;
pub mod codec;
pub mod deadline;
pub mod error;
pub mod handshake;
pub mod header;
pub mod image;
pub mod link;
pub mod monitor;
pub mod session;
pub mod sim;
pub mod state;
pub mod window;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use assembler::{PhaseResult, ResultAssembler};
pub use codec::{MAX_LINE_LENGTH, RowCodec};
pub use deadline::{Deadline, poll_until};
pub use error::{Result, TransferError};
pub use handshake::{DEFAULT_GO_TOKEN, DEFAULT_READY_TOKEN, send_token, wait_for_token};
pub use header::{DEFAULT_DIAGNOSTIC_MARKER, FilteredHeader, HeaderParser, HeaderState};
pub use image::{ImageGrid, MAX_MAXVAL, PGM_MAGIC, load_pgm, parse_pgm, render_pgm, write_pgm};
pub use link::{AsyncStream, BoxedLink, BoxedStream, LinkTransport, StreamLink};
pub use monitor::capture_frame;
pub use session::{GridWriter, SessionConfig, TransferSession};
pub use sim::SimulatedPeer;
pub use state::SessionState;
pub use window::{DEFAULT_BUFFER_ROWS, Phase, PhasePlan, TransferWindow, WindowPlan};
