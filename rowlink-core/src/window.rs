//! The windowing rule: which rows travel in each phase and which rows
//! come back.
//!
//! With a peer buffer of `B` rows and an image of `H = 2(B−1)` rows:
//!
//! ```text
//!  phase 1 input   [0,   B−1]   (row B−1 is look-ahead context only)
//!  phase 1 output  [0,   B−2]
//!  phase 2 input   [B−2, H−1]   (row B−2 is look-behind context only)
//!  phase 2 output  [B−1, H−1]
//! ```

use std::fmt;

use crate::error::{Result, TransferError};

/// Default number of rows the peer can buffer.
pub const DEFAULT_BUFFER_ROWS: usize = 46;

// ── Phase ────────────────────────────────────────────────────────

/// One half of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    One,
    Two,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One => write!(f, "phase 1"),
            Self::Two => write!(f, "phase 2"),
        }
    }
}

// ── TransferWindow ───────────────────────────────────────────────

/// Inclusive row range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferWindow {
    pub start: usize,
    pub end: usize,
}

impl TransferWindow {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end, "window start after end");
        Self { start, end }
    }

    /// Number of rows covered.
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    /// A window always covers at least one row.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, row: usize) -> bool {
        (self.start..=self.end).contains(&row)
    }

    /// Row indices in ascending order.
    pub fn rows(&self) -> std::ops::RangeInclusive<usize> {
        self.start..=self.end
    }
}

impl fmt::Display for TransferWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

// ── PhasePlan / WindowPlan ───────────────────────────────────────

/// Input window sent to the peer and the rows expected back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhasePlan {
    pub phase: Phase,
    pub input: TransferWindow,
    pub output: TransferWindow,
}

impl PhasePlan {
    /// Number of filtered rows the peer returns for this phase.
    pub fn expected_rows(&self) -> usize {
        self.output.len()
    }
}

/// Both phases of a session, derived from the buffer capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlan {
    buffer_rows: usize,
    height: usize,
    phase1: PhasePlan,
    phase2: PhasePlan,
}

impl WindowPlan {
    /// Compute the plan for an image of `height` rows.
    ///
    /// Fails unless `buffer_rows >= 2` and `height == 2 * (buffer_rows - 1)`.
    pub fn new(buffer_rows: usize, height: usize) -> Result<Self> {
        if buffer_rows < 2 {
            return Err(TransferError::Configuration(format!(
                "buffer capacity must be at least 2 rows, got {buffer_rows}"
            )));
        }
        let required = Self::required_height(buffer_rows);
        if height != required {
            return Err(TransferError::Configuration(format!(
                "image height {height} does not fit a {buffer_rows}-row buffer \
                 (requires height = 2 * ({buffer_rows} - 1) = {required})"
            )));
        }

        let b = buffer_rows;
        Ok(Self {
            buffer_rows,
            height,
            phase1: PhasePlan {
                phase: Phase::One,
                input: TransferWindow::new(0, b - 1),
                output: TransferWindow::new(0, b - 2),
            },
            phase2: PhasePlan {
                phase: Phase::Two,
                input: TransferWindow::new(b - 2, height - 1),
                output: TransferWindow::new(b - 1, height - 1),
            },
        })
    }

    /// The only image height a `buffer_rows` peer can process.
    pub fn required_height(buffer_rows: usize) -> usize {
        2 * buffer_rows.saturating_sub(1)
    }

    pub fn buffer_rows(&self) -> usize {
        self.buffer_rows
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Rows returned per phase (`B − 1`).
    pub fn rows_per_phase(&self) -> usize {
        self.buffer_rows - 1
    }

    pub fn phase(&self, phase: Phase) -> &PhasePlan {
        match phase {
            Phase::One => &self.phase1,
            Phase::Two => &self.phase2,
        }
    }
}
