//! Passive capture of whole frames from a peer that streams its filtered
//! image on its own, without the two-phase exchange.

use std::ops::ControlFlow;
use std::time::Duration;

use tracing::{debug, info};

use crate::deadline::{Deadline, poll_until};
use crate::error::{Result, TransferError};
use crate::header::{FilteredHeader, HeaderParser, HeaderState};
use crate::image::ImageGrid;
use crate::link::LinkTransport;
use crate::session::{PROGRESS_EVERY, SessionConfig};
use crate::window::Phase;

/// Read one complete frame: header, then `height` rows of `width` values.
///
/// A magic line after the header has started restarts the frame, so a peer
/// that reboots mid-frame loses only the interrupted frame.
///
/// `timeout` bounds the whole frame. Expiry before the header is a
/// `HeaderTimeout`; expiry while collecting rows is a `CaptureTimeout`
/// reported against phase 1, since a streamed frame has a single phase.
pub async fn capture_frame<L: LinkTransport + ?Sized>(
    link: &mut L,
    config: &SessionConfig,
    timeout: Duration,
) -> Result<ImageGrid> {
    let deadline = Deadline::after(timeout);
    let mut parser = HeaderParser::new(&config.magic, &config.diagnostic_marker);
    let mut header: Option<FilteredHeader> = None;
    let mut rows: Vec<Vec<u32>> = Vec::new();

    let complete = poll_until(deadline, async || {
        let Some(line) = link.read_line(deadline).await? else {
            return Ok(ControlFlow::Continue(()));
        };

        if line.trim() == config.magic
            && (header.is_some() || parser.state() != HeaderState::ExpectMagic)
        {
            info!("frame restarted by peer after {} rows", rows.len());
            parser = HeaderParser::new(&config.magic, &config.diagnostic_marker);
            header = None;
            rows.clear();
        }

        let Some(current) = header else {
            if let Some(found) = parser.feed(&line)? {
                debug!("frame header {}x{} maxval {}", found.width, found.height, found.maxval);
                rows = Vec::with_capacity(found.height);
                header = Some(found);
            }
            return Ok(ControlFlow::Continue(()));
        };

        if let Some(row) = current.row_from_line(&line, &config.diagnostic_marker)? {
            rows.push(row);
            if rows.len() % PROGRESS_EVERY == 0 {
                debug!("frame: {}/{} rows", rows.len(), current.height);
            }
        }
        Ok(if rows.len() == current.height {
            ControlFlow::Break(current)
        } else {
            ControlFlow::Continue(())
        })
    })
    .await?;

    let Some(header) = complete else {
        return Err(match header {
            None => TransferError::HeaderTimeout(timeout),
            Some(header) => TransferError::CaptureTimeout {
                stage: Phase::One,
                got: rows.len(),
                expected: header.height,
            },
        });
    };

    let grid = ImageGrid::new(header.width, header.height, header.maxval, rows)?;
    info!("captured {}x{} frame", grid.width(), grid.height());
    Ok(grid)
}

#[cfg(test)]
mod tests {
    use tokio_test::io::Builder;

    use super::*;
    use crate::link::StreamLink;

    #[tokio::test]
    async fn captures_frame_after_noise() {
        let mock = Builder::new()
            .read(b"booting\nERROR sensor warm-up\nP2\n3 2\n")
            .read(b"15\n1 2 3\n\n4 5 6\n")
            .build();
        let mut link = StreamLink::new(mock);
        let grid = capture_frame(&mut link, &SessionConfig::default(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(grid.width(), 3);
        assert_eq!(grid.maxval(), 15);
        assert_eq!(grid.row(1).unwrap(), &[4, 5, 6]);
    }

    #[tokio::test]
    async fn short_row_is_malformed() {
        let mock = Builder::new().read(b"P2\n3 2\n255\n1 2\n").build();
        let mut link = StreamLink::new(mock);
        let err = capture_frame(&mut link, &SessionConfig::default(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::MalformedImage { .. }));
    }

    #[tokio::test]
    async fn magic_line_restarts_an_interrupted_frame() {
        let mock = Builder::new()
            .read(b"P2\n2 2\n255\n1 2\nP2\n2 2\n255\n5 6\n7 8\n")
            .build();
        let mut link = StreamLink::new(mock);
        let grid = capture_frame(&mut link, &SessionConfig::default(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(grid.row(0).unwrap(), &[5, 6]);
        assert_eq!(grid.row(1).unwrap(), &[7, 8]);
    }

    #[tokio::test]
    async fn magic_line_restarts_a_half_read_header() {
        let mock = Builder::new()
            .read(b"P2\n3 3\nP2\n1 1\n9\n4\n")
            .build();
        let mut link = StreamLink::new(mock);
        let grid = capture_frame(&mut link, &SessionConfig::default(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(grid.maxval(), 9);
        assert_eq!(grid.row(0).unwrap(), &[4]);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_frame_times_out_with_count() {
        let (near, mut far) = tokio::io::duplex(256);
        tokio::io::AsyncWriteExt::write_all(&mut far, b"P2\n2 3\n255\n1 1\n")
            .await
            .unwrap();
        let mut link = StreamLink::new(near);
        let err = capture_frame(&mut link, &SessionConfig::default(), Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::CaptureTimeout {
                got: 1,
                expected: 3,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_link_is_header_timeout() {
        let (near, _far) = tokio::io::duplex(16);
        let mut link = StreamLink::new(near);
        let err = capture_frame(&mut link, &SessionConfig::default(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::HeaderTimeout(_)));
    }
}
