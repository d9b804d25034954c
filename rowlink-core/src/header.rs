//! The filtered-image header announced by the peer, and the line parser
//! that recognises it.
//!
//! ```text
//!  ExpectMagic ──"P2"──► ExpectDims ──"W H"──► ExpectMaxval ──"M"──► Done
//! ```
//!
//! Blank lines and diagnostic lines are skipped in every state.

use std::fmt;

use tracing::{debug, warn};

use crate::codec::parse_row;
use crate::error::{Result, TransferError};
use crate::image::{MAX_MAXVAL, PGM_MAGIC};

/// Prefix marking a peer log line that carries no protocol data.
pub const DEFAULT_DIAGNOSTIC_MARKER: &str = "ERROR";

// ── FilteredHeader ───────────────────────────────────────────────

/// Dimensions the peer declares for the filtered image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilteredHeader {
    pub width: usize,
    pub height: usize,
    pub maxval: u32,
}

impl FilteredHeader {
    /// Interpret one captured line as a filtered row.
    ///
    /// Blank and diagnostic lines yield `Ok(None)`. A data line must hold
    /// exactly `width` integers, none above `maxval`.
    pub fn row_from_line(&self, line: &str, marker: &str) -> Result<Option<Vec<u32>>> {
        let data = match classify(line, marker) {
            LineKind::Blank => return Ok(None),
            LineKind::Diagnostic(text) => {
                warn!("peer: {text}");
                return Ok(None);
            }
            LineKind::Data(data) => data,
        };
        let row = parse_row(data)?;
        if row.len() != self.width {
            return Err(TransferError::malformed("row width", self.width, row.len()));
        }
        if let Some(&v) = row.iter().find(|&&v| v > self.maxval) {
            return Err(TransferError::malformed(
                "pixel value",
                format!("<= {}", self.maxval),
                v,
            ));
        }
        Ok(Some(row))
    }
}

// ── Line classification ──────────────────────────────────────────

/// What a single received line means before protocol parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind<'a> {
    Blank,
    Diagnostic(&'a str),
    Data(&'a str),
}

/// Classify `line` against the diagnostic `marker`.
pub fn classify<'a>(line: &'a str, marker: &str) -> LineKind<'a> {
    let line = line.trim();
    if line.is_empty() {
        LineKind::Blank
    } else if !marker.is_empty() && line.starts_with(marker) {
        LineKind::Diagnostic(line)
    } else {
        LineKind::Data(line)
    }
}

// ── HeaderParser ─────────────────────────────────────────────────

/// Parser position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    ExpectMagic,
    ExpectDims { width: usize, height: usize },
    ExpectMaxval { width: usize, height: usize },
    Done(FilteredHeader),
}

impl fmt::Display for HeaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExpectMagic => write!(f, "ExpectMagic"),
            Self::ExpectDims { .. } => write!(f, "ExpectDims"),
            Self::ExpectMaxval { .. } => write!(f, "ExpectMaxval"),
            Self::Done(_) => write!(f, "Done"),
        }
    }
}

/// Consumes peer lines one at a time until a full header is seen.
#[derive(Debug, Clone)]
pub struct HeaderParser {
    state: HeaderState,
    magic: String,
    marker: String,
    noise: usize,
}

impl HeaderParser {
    pub fn new(magic: impl Into<String>, marker: impl Into<String>) -> Self {
        Self {
            state: HeaderState::ExpectMagic,
            magic: magic.into(),
            marker: marker.into(),
            noise: 0,
        }
    }

    pub fn state(&self) -> HeaderState {
        self.state
    }

    /// Lines dropped while waiting for the magic.
    pub fn noise_lines(&self) -> usize {
        self.noise
    }

    /// Feed one line. Returns the header once complete.
    pub fn feed(&mut self, line: &str) -> Result<Option<FilteredHeader>> {
        let data = match classify(line, &self.marker) {
            LineKind::Blank => return Ok(None),
            LineKind::Diagnostic(text) => {
                warn!("peer: {text}");
                return Ok(None);
            }
            LineKind::Data(data) => data,
        };

        self.state = match self.state {
            HeaderState::ExpectMagic => {
                if data == self.magic {
                    debug!("header magic {data:?} detected");
                    HeaderState::ExpectDims {
                        width: 0,
                        height: 0,
                    }
                } else {
                    self.noise += 1;
                    debug!("discarding pre-header line {data:?}");
                    HeaderState::ExpectMagic
                }
            }
            HeaderState::ExpectDims { .. } => {
                let (width, height) = parse_dims(data)?;
                debug!("header dimensions {width}x{height}");
                HeaderState::ExpectMaxval { width, height }
            }
            HeaderState::ExpectMaxval { width, height } => {
                let maxval = parse_maxval(data)?;
                debug!("header maxval {maxval}");
                HeaderState::Done(FilteredHeader {
                    width,
                    height,
                    maxval,
                })
            }
            HeaderState::Done(_) => {
                return Err(TransferError::ProtocolViolation(
                    "header parser fed after completion",
                ));
            }
        };

        Ok(match self.state {
            HeaderState::Done(header) => Some(header),
            _ => None,
        })
    }
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self::new(PGM_MAGIC, DEFAULT_DIAGNOSTIC_MARKER)
    }
}

fn parse_dims(line: &str) -> Result<(usize, usize)> {
    let bad = || TransferError::malformed("header dimensions", "\"<width> <height>\"", line);
    let mut parts = line.split_whitespace();
    let (Some(w), Some(h), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(bad());
    };
    let width = w.parse::<usize>().map_err(|_| bad())?;
    let height = h.parse::<usize>().map_err(|_| bad())?;
    if width == 0 || height == 0 {
        return Err(bad());
    }
    Ok((width, height))
}

fn parse_maxval(line: &str) -> Result<u32> {
    match line.parse::<u32>() {
        Ok(v) if (1..=MAX_MAXVAL).contains(&v) => Ok(v),
        _ => Err(TransferError::malformed(
            "header maxval",
            format!("1..={MAX_MAXVAL}"),
            line,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut HeaderParser, lines: &[&str]) -> Result<Option<FilteredHeader>> {
        let mut out = None;
        for line in lines {
            out = parser.feed(line)?;
        }
        Ok(out)
    }

    #[test]
    fn parses_plain_header() {
        let mut p = HeaderParser::default();
        let header = feed_all(&mut p, &["P2", "90 90", "255"]).unwrap().unwrap();
        assert_eq!(
            header,
            FilteredHeader {
                width: 90,
                height: 90,
                maxval: 255
            }
        );
        assert!(matches!(p.state(), HeaderState::Done(_)));
    }

    #[test]
    fn skips_blank_and_diagnostic_lines_in_every_state() {
        let mut p = HeaderParser::default();
        let header = feed_all(
            &mut p,
            &["", "ERROR boot", "P2", "  ", "ERROR mid", "4 4", "ERROR late", "", "15"],
        )
        .unwrap()
        .unwrap();
        assert_eq!(header.width, 4);
        assert_eq!(header.maxval, 15);
        assert_eq!(p.noise_lines(), 0);
    }

    #[test]
    fn drops_noise_before_magic() {
        let mut p = HeaderParser::default();
        assert_eq!(p.feed("booting v2").unwrap(), None);
        assert_eq!(p.state(), HeaderState::ExpectMagic);
        assert_eq!(p.noise_lines(), 1);
        assert!(feed_all(&mut p, &["P2", "2 2", "255"]).unwrap().is_some());
    }

    #[test]
    fn rejects_bad_dimensions_deterministically() {
        let mut p = HeaderParser::default();
        p.feed("P2").unwrap();
        let err = p.feed("90").unwrap_err();
        assert!(matches!(
            err,
            TransferError::MalformedImage {
                field: "header dimensions",
                ..
            }
        ));
    }

    #[test]
    fn rejects_bad_maxval() {
        let mut p = HeaderParser::default();
        p.feed("P2").unwrap();
        p.feed("90 90").unwrap();
        assert!(p.feed("0").is_err());
    }

    #[test]
    fn refuses_input_after_done() {
        let mut p = HeaderParser::default();
        feed_all(&mut p, &["P2", "1 1", "1"]).unwrap();
        assert!(matches!(
            p.feed("1 2 3"),
            Err(TransferError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn row_from_line_checks_shape() {
        let header = FilteredHeader {
            width: 3,
            height: 2,
            maxval: 15,
        };
        assert_eq!(header.row_from_line("1 2 3", "ERROR").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(header.row_from_line("ERROR overflow", "ERROR").unwrap(), None);
        assert_eq!(header.row_from_line("", "ERROR").unwrap(), None);
        assert!(header.row_from_line("1 2", "ERROR").is_err());
        assert!(header.row_from_line("1 2 16", "ERROR").is_err());
        assert!(header.row_from_line("1 x 3", "ERROR").is_err());
    }

    #[test]
    fn classify_lines() {
        assert_eq!(classify("  ", "ERROR"), LineKind::Blank);
        assert_eq!(classify("ERROR: x", "ERROR"), LineKind::Diagnostic("ERROR: x"));
        assert_eq!(classify(" 1 2 ", "ERROR"), LineKind::Data("1 2"));
    }
}
