//! In-memory grayscale image and the plain-text PGM (`P2`) format.
//!
//! ```text
//! P2
//! # optional full-line comments
//! <width> <height>
//! <maxval>
//! <width × height integers, any whitespace, any number of lines>
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, TransferError};

/// Magic token opening a plain-text PGM file.
pub const PGM_MAGIC: &str = "P2";

/// Largest maxval the format allows.
pub const MAX_MAXVAL: u32 = 65_535;

// ── ImageGrid ────────────────────────────────────────────────────

/// Row-major grayscale pixel grid.
///
/// The shape invariants (`rows.len() == height`, every row `width` long,
/// every value `<= maxval`) are enforced at construction and cannot be
/// broken afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageGrid {
    width: usize,
    height: usize,
    maxval: u32,
    rows: Vec<Vec<u32>>,
}

impl ImageGrid {
    /// Build a grid, validating every shape invariant.
    pub fn new(width: usize, height: usize, maxval: u32, rows: Vec<Vec<u32>>) -> Result<Self> {
        if maxval == 0 || maxval > MAX_MAXVAL {
            return Err(TransferError::malformed(
                "maxval",
                format!("1..={MAX_MAXVAL}"),
                maxval,
            ));
        }
        if rows.len() != height {
            return Err(TransferError::malformed("row count", height, rows.len()));
        }
        for row in &rows {
            if row.len() != width {
                return Err(TransferError::malformed("row width", width, row.len()));
            }
            if let Some(&v) = row.iter().find(|&&v| v > maxval) {
                return Err(TransferError::malformed(
                    "pixel value",
                    format!("<= {maxval}"),
                    v,
                ));
            }
        }
        Ok(Self {
            width,
            height,
            maxval,
            rows,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn maxval(&self) -> u32 {
        self.maxval
    }

    /// Row `index`, if in range.
    pub fn row(&self, index: usize) -> Option<&[u32]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    pub fn rows(&self) -> &[Vec<u32>] {
        &self.rows
    }

    /// Whether `width == height`.
    pub fn is_square(&self) -> bool {
        self.width == self.height
    }
}

// ── Parsing ──────────────────────────────────────────────────────

/// Parse a `P2` document.
///
/// Header fields and pixel data are read as whitespace-separated tokens,
/// so data may wrap arbitrarily; the pixels are then re-chunked into
/// `height` rows of `width` values.
pub fn parse_pgm(text: &str) -> Result<ImageGrid> {
    let mut tokens = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .flat_map(str::split_whitespace);

    let magic = tokens.next().unwrap_or_default();
    if magic != PGM_MAGIC {
        return Err(TransferError::malformed("magic", PGM_MAGIC, magic));
    }
    let width = header_field(tokens.next(), "width")?;
    let height = header_field(tokens.next(), "height")?;
    let maxval = header_field(tokens.next(), "maxval")?;

    let pixels = tokens
        .map(|t| {
            t.parse::<u32>()
                .map_err(|_| TransferError::malformed("pixel value", "integer", t))
        })
        .collect::<Result<Vec<u32>>>()?;

    let expected = width.saturating_mul(height);
    if pixels.len() != expected {
        return Err(TransferError::malformed("pixel count", expected, pixels.len()));
    }

    let rows = if width == 0 {
        vec![Vec::new(); height]
    } else {
        pixels.chunks(width).map(<[u32]>::to_vec).collect()
    };
    ImageGrid::new(width, height, u32::try_from(maxval).unwrap_or(u32::MAX), rows)
}

fn header_field(token: Option<&str>, field: &'static str) -> Result<usize> {
    let token = token.ok_or_else(|| TransferError::malformed(field, "integer", "end of input"))?;
    token
        .parse::<usize>()
        .map_err(|_| TransferError::malformed(field, "integer", token))
}

/// Load and parse a `P2` file.
pub fn load_pgm(path: &Path) -> Result<ImageGrid> {
    let text = std::fs::read_to_string(path).map_err(|source| TransferError::ImageIo {
        path: path.to_path_buf(),
        source,
    })?;
    let grid = parse_pgm(&text)?;
    debug!(
        "loaded {}: {}x{} maxval={}",
        path.display(),
        grid.width(),
        grid.height(),
        grid.maxval()
    );
    Ok(grid)
}

// ── Rendering ────────────────────────────────────────────────────

/// Render a grid as a `P2` document, one row per line.
pub fn render_pgm(grid: &ImageGrid) -> String {
    let mut out = format!("{PGM_MAGIC}\n{} {}\n{}\n", grid.width, grid.height, grid.maxval);
    for row in &grid.rows {
        let line = row
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Write `grid` to `path` atomically.
///
/// The document goes to a temporary file in the destination directory
/// which is renamed over `path` only after a successful flush; an aborted
/// write leaves nothing behind.
pub fn write_pgm(grid: &ImageGrid, path: &Path) -> Result<PathBuf> {
    let io_err = |source| TransferError::ImageIo {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(render_pgm(grid).as_bytes()).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(path.to_path_buf())
}
