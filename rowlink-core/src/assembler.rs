//! Merges the two captured phases into the final image.

use tracing::debug;

use crate::error::{Result, TransferError};
use crate::header::FilteredHeader;
use crate::image::ImageGrid;
use crate::window::Phase;

/// Rows captured during one phase, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseResult {
    pub phase: Phase,
    pub rows: Vec<Vec<u32>>,
}

impl PhaseResult {
    pub fn new(phase: Phase, rows: Vec<Vec<u32>>) -> Self {
        Self { phase, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Validates phase results against the header and concatenates them.
#[derive(Debug, Clone, Copy)]
pub struct ResultAssembler {
    rows_per_phase: usize,
}

impl ResultAssembler {
    /// Assembler for a peer returning `rows_per_phase` (`B − 1`) rows per
    /// phase.
    pub fn new(rows_per_phase: usize) -> Self {
        Self { rows_per_phase }
    }

    /// Merge `phase1` and `phase2` into one grid shaped by `header`.
    ///
    /// Checks run in a fixed order so the reported field is
    /// deterministic: phase 1 length, phase 2 length, header height,
    /// row widths, then pixel values.
    pub fn merge(
        &self,
        header: &FilteredHeader,
        phase1: PhaseResult,
        phase2: PhaseResult,
    ) -> Result<ImageGrid> {
        if phase1.len() != self.rows_per_phase {
            return Err(TransferError::malformed(
                "phase1.length",
                self.rows_per_phase,
                phase1.len(),
            ));
        }
        if phase2.len() != self.rows_per_phase {
            return Err(TransferError::malformed(
                "phase2.length",
                self.rows_per_phase,
                phase2.len(),
            ));
        }
        let total = phase1.len() + phase2.len();
        if header.height != total {
            return Err(TransferError::malformed("header.height", total, header.height));
        }

        let rows: Vec<Vec<u32>> = phase1.rows.into_iter().chain(phase2.rows).collect();
        if let Some((index, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != header.width)
        {
            return Err(TransferError::malformed(
                "row.width",
                header.width,
                format!("{} (row {index})", row.len()),
            ));
        }

        debug!(
            "assembling {}x{} image from two phases of {} rows",
            header.width, header.height, self.rows_per_phase
        );
        ImageGrid::new(header.width, header.height, header.maxval, rows)
    }
}
