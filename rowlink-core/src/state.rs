//! Session state machine.
//!
//! Models the lifecycle of one transfer session with validated
//! transitions that return `Result` instead of panicking.

use crate::error::{Result, TransferError};

// ── SessionState ─────────────────────────────────────────────────

/// Where a session is in the two-phase protocol.
///
/// ```text
///  Init ─► SendPhase1 ─► AwaitHeader ─► CapturePhase1 ─► AwaitReady
///                                                             │
///  Done ◄─ Assemble ◄─ CapturePhase2 ◄─ SendPhase2 ◄─ SendGo ◄┘
///
///  any non-terminal state ──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Init,
    SendPhase1,
    AwaitHeader,
    CapturePhase1,
    AwaitReady,
    SendGo,
    SendPhase2,
    CapturePhase2,
    Assemble,
    Done,
    /// The session ended with an error raised in `during`.
    Failed {
        during: &'static str,
    },
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { during } => write!(f, "Failed (during {during})"),
            other => f.write_str(other.name()),
        }
    }
}

impl SessionState {
    /// Short name of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::SendPhase1 => "SendPhase1",
            Self::AwaitHeader => "AwaitHeader",
            Self::CapturePhase1 => "CapturePhase1",
            Self::AwaitReady => "AwaitReady",
            Self::SendGo => "SendGo",
            Self::SendPhase2 => "SendPhase2",
            Self::CapturePhase2 => "CapturePhase2",
            Self::Assemble => "Assemble",
            Self::Done => "Done",
            Self::Failed { .. } => "Failed",
        }
    }

    /// Returns `true` for `Done` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }

    /// The state that follows this one on the success path.
    fn successor(&self) -> Option<Self> {
        Some(match self {
            Self::Init => Self::SendPhase1,
            Self::SendPhase1 => Self::AwaitHeader,
            Self::AwaitHeader => Self::CapturePhase1,
            Self::CapturePhase1 => Self::AwaitReady,
            Self::AwaitReady => Self::SendGo,
            Self::SendGo => Self::SendPhase2,
            Self::SendPhase2 => Self::CapturePhase2,
            Self::CapturePhase2 => Self::Assemble,
            Self::Assemble => Self::Done,
            Self::Done | Self::Failed { .. } => return None,
        })
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Move to `next`.
    ///
    /// Valid only when `next` is the immediate successor of the current
    /// state.
    pub fn advance(&mut self, next: SessionState) -> Result<()> {
        match self.successor() {
            Some(expected) if expected == next => {
                *self = next;
                Ok(())
            }
            Some(_) => Err(TransferError::ProtocolViolation(
                "out-of-order session transition",
            )),
            None => Err(TransferError::ProtocolViolation(
                "session already finished",
            )),
        }
    }

    /// Move to `Failed`, recording the current state name.
    ///
    /// Valid from any non-terminal state.
    pub fn fail(&mut self) -> Result<()> {
        if self.is_terminal() {
            return Err(TransferError::ProtocolViolation(
                "cannot fail: session already finished",
            ));
        }
        *self = Self::Failed {
            during: self.name(),
        };
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
