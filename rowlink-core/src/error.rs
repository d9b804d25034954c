//! Error types for a row-transfer session.
//!
//! Every fallible operation returns `Result<T, TransferError>`; the
//! orchestrator reports exactly one of these per failed session.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::window::Phase;

/// The single discriminated outcome of a failed transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    // ── Configuration ────────────────────────────────────────────
    /// The image or buffer capacity cannot satisfy the windowing rule.
    /// Raised before any byte touches the link.
    #[error("configuration error: {0}")]
    Configuration(String),

    // ── Data shape ───────────────────────────────────────────────
    /// Pixel data (loaded from disk or captured from the peer) has the
    /// wrong shape or out-of-range values.
    #[error("malformed image: {field} expected {expected}, got {actual}")]
    MalformedImage {
        field: &'static str,
        expected: String,
        actual: String,
    },

    // ── Timeouts ─────────────────────────────────────────────────
    /// The peer did not announce the filtered header in time.
    #[error("timed out after {0:?} waiting for the filtered header")]
    HeaderTimeout(Duration),

    /// The device-ready token never appeared on the link.
    #[error("timed out after {after:?} waiting for handshake token {token:?}")]
    HandshakeTimeout { token: String, after: Duration },

    /// Fewer rows than expected arrived before the capture deadline.
    #[error("capture timeout in {stage}: got {got}/{expected} rows")]
    CaptureTimeout {
        stage: Phase,
        got: usize,
        expected: usize,
    },

    // ── Link ─────────────────────────────────────────────────────
    /// Open, read or write failure on the link, including peer hang-up.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The peer sent more bytes than a row can hold without a newline.
    #[error("line too long: {size} bytes without newline (max {max})")]
    LineTooLong { size: usize, max: usize },

    // ── Files ────────────────────────────────────────────────────
    /// Reading the source image or writing the result failed.
    #[error("cannot access {}: {source}", path.display())]
    ImageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Session ──────────────────────────────────────────────────
    /// The session was aborted from outside (e.g. Ctrl-C).
    #[error("session cancelled")]
    Cancelled,

    /// An operation was attempted in a state that does not allow it.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
}

impl TransferError {
    /// Shorthand for building a [`TransferError::MalformedImage`].
    pub fn malformed(
        field: &'static str,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        TransferError::MalformedImage {
            field,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Human-readable name of the stage that produced this error.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::MalformedImage { .. } => "validation",
            Self::HeaderTimeout(_) => "header",
            Self::HandshakeTimeout { .. } => "handshake",
            Self::CaptureTimeout { stage, .. } => match stage {
                Phase::One => "capture phase 1",
                Phase::Two => "capture phase 2",
            },
            Self::Transport(_) | Self::LineTooLong { .. } => "transport",
            Self::ImageIo { .. } => "file",
            Self::Cancelled => "cancelled",
            Self::ProtocolViolation(_) => "session",
        }
    }

    /// Whether the error came from a wait running out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::HeaderTimeout(_) | Self::HandshakeTimeout { .. } | Self::CaptureTimeout { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransferError>;
