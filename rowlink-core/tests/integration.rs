//! Integration tests: full sessions against simulated and scripted peers
//! over in-memory links, including timeouts, aborts and cancellation.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rowlink_core::{
    Deadline, GridWriter, ImageGrid, LinkTransport, Phase, SessionConfig, SessionState,
    SimulatedPeer, StreamLink, TransferError, TransferSession, write_pgm,
};
use tokio::io::DuplexStream;
use tokio_test::io::Builder;
use tokio_util::sync::CancellationToken;

// ── Helpers ──────────────────────────────────────────────────────

/// Square-ish test image whose pixels encode their own position.
fn gradient(width: usize, height: usize) -> ImageGrid {
    let rows = (0..height)
        .map(|r| (0..width).map(|c| ((r * 7 + c * 3) % 256) as u32).collect())
        .collect();
    ImageGrid::new(width, height, 255, rows).unwrap()
}

fn config(buffer_rows: usize) -> SessionConfig {
    SessionConfig {
        buffer_rows,
        ..SessionConfig::default()
    }
}

/// Read `count` row lines on the device side.
async fn read_window(link: &mut StreamLink<DuplexStream>, count: usize) -> Vec<String> {
    let deadline = Deadline::after(Duration::from_secs(60));
    let mut lines = Vec::with_capacity(count);
    while lines.len() < count {
        let line = link.read_line(deadline).await.unwrap().unwrap();
        lines.push(line);
    }
    lines
}

fn header_and_rows(width: usize, height: usize, rows: &[String]) -> Vec<u8> {
    let mut out = format!("P2\n{width} {height}\n255\n");
    for row in rows {
        out.push_str(row);
        out.push('\n');
    }
    out.into_bytes()
}

/// Link that records every call and never yields data.
#[derive(Debug, Default)]
struct RecordingLink {
    writes: usize,
    reads: usize,
    resets: usize,
    closed: bool,
}

#[async_trait]
impl LinkTransport for RecordingLink {
    async fn write(&mut self, _bytes: &[u8]) -> rowlink_core::Result<()> {
        self.writes += 1;
        Ok(())
    }

    async fn read_line(&mut self, _deadline: Deadline) -> rowlink_core::Result<Option<String>> {
        self.reads += 1;
        Ok(None)
    }

    async fn bytes_available(&mut self) -> rowlink_core::Result<usize> {
        Ok(0)
    }

    async fn read_byte(&mut self, _deadline: Deadline) -> rowlink_core::Result<Option<u8>> {
        self.reads += 1;
        Ok(None)
    }

    async fn reset_input_buffer(&mut self) -> rowlink_core::Result<usize> {
        self.resets += 1;
        Ok(0)
    }

    async fn close(&mut self) -> rowlink_core::Result<()> {
        self.closed = true;
        Ok(())
    }
}

// ── Round trips ──────────────────────────────────────────────────

#[tokio::test]
async fn test_identity_round_trip_default_buffer() {
    let image = gradient(90, 90);
    let (near, far) = tokio::io::duplex(4096);
    let peer = tokio::spawn(SimulatedPeer::default().serve(far));

    let mut session = TransferSession::new(StreamLink::new(near), SessionConfig::default());
    let out = session.run(&image).await.unwrap();

    assert_eq!(out, image);
    assert_eq!(session.state(), SessionState::Done);
    peer.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_worked_example_four_by_four() {
    let rows = (0..4u32)
        .map(|r| (1..=4).map(|c| r * 4 + c).collect())
        .collect();
    let image = ImageGrid::new(4, 4, 255, rows).unwrap();

    let (near, far) = tokio::io::duplex(256);
    let peer = tokio::spawn(SimulatedPeer::new(3).serve(far));

    let mut session = TransferSession::new(StreamLink::new(near), config(3));
    let out = session.run(&image).await.unwrap();

    assert_eq!(out.row(0).unwrap(), &[1, 2, 3, 4]);
    assert_eq!(out.row(1).unwrap(), &[5, 6, 7, 8]);
    assert_eq!(out.row(2).unwrap(), &[9, 10, 11, 12]);
    assert_eq!(out.row(3).unwrap(), &[13, 14, 15, 16]);
    assert_eq!(out, image);
    peer.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_diagnostic_chatter_is_skipped() {
    let image = gradient(5, 8);
    let (near, far) = tokio::io::duplex(1024);
    let peer = tokio::spawn(
        SimulatedPeer::new(5)
            .with_chatter("ERROR: filter overrun")
            .serve(far),
    );

    let mut session = TransferSession::new(StreamLink::new(near), config(5));
    assert_eq!(session.run(&image).await.unwrap(), image);
    peer.await.unwrap().unwrap();
}

// ── Windowing ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_phase2_sends_rows_two_to_five_in_order() {
    // W=3, H=6, B=4: phase 2 input window is [2, 5].
    let rows = (0..6u32).map(|r| vec![r * 3, r * 3 + 1, r * 3 + 2]).collect();
    let image = ImageGrid::new(3, 6, 255, rows).unwrap();

    let mock = Builder::new()
        .write(b"0 1 2\n")
        .write(b"3 4 5\n")
        .write(b"6 7 8\n")
        .write(b"9 10 11\n")
        .read(b"P2\n3 6\n255\n0 1 2\n3 4 5\n6 7 8\n#READY2#")
        .write(b"#GO2#")
        .write(b"6 7 8\n")
        .write(b"9 10 11\n")
        .write(b"12 13 14\n")
        .write(b"15 16 17\n")
        .read(b"9 10 11\n12 13 14\n15 16 17\n")
        .build();

    let mut session = TransferSession::new(StreamLink::new(mock), config(4));
    assert_eq!(session.run(&image).await.unwrap(), image);
}

#[tokio::test]
async fn test_invalid_height_rejected_before_any_io() {
    let image = gradient(90, 89);
    let mut session = TransferSession::new(RecordingLink::default(), SessionConfig::default());

    let err = session.run(&image).await.unwrap_err();
    assert!(matches!(err, TransferError::Configuration(_)));
    assert!(err.to_string().contains("89"));

    let link = session.into_link();
    assert_eq!(link.writes, 0);
    assert_eq!(link.reads, 0);
    assert_eq!(link.resets, 0);
    assert!(link.closed);
}

#[tokio::test]
async fn test_off_by_one_heights_rejected_for_every_buffer_size() {
    for buffer_rows in 2..=10 {
        let fit = 2 * (buffer_rows - 1);
        for height in [fit - 1, fit + 1] {
            let image = gradient(4, height);
            let mut session = TransferSession::new(RecordingLink::default(), config(buffer_rows));

            let err = session.run(&image).await.unwrap_err();
            assert!(
                matches!(err, TransferError::Configuration(_)),
                "B={buffer_rows} H={height}: {err}"
            );

            let link = session.into_link();
            assert_eq!(link.writes, 0, "B={buffer_rows} H={height}");
            assert_eq!(link.reads, 0, "B={buffer_rows} H={height}");
        }
    }
}

#[tokio::test]
async fn test_tiny_buffer_rejected() {
    let image = gradient(1, 0);
    let mut session = TransferSession::new(RecordingLink::default(), config(1));
    let err = session.run(&image).await.unwrap_err();
    assert!(matches!(err, TransferError::Configuration(_)));
    assert_eq!(session.into_link().writes, 0);
}

// ── Handshake ────────────────────────────────────────────────────

#[tokio::test]
async fn test_stale_bytes_after_ready_are_discarded() {
    let image = gradient(2, 4);
    let (near, far) = tokio::io::duplex(1024);

    let peer = tokio::spawn(async move {
        let mut link = StreamLink::new(far);
        let first = read_window(&mut link, 3).await;
        let mut out = header_and_rows(2, 4, &first[..2]);
        // Leftovers in the same burst as the token must not become rows.
        out.extend_from_slice(b"#READY2#99 99\n98 98\n");
        link.write(&out).await.unwrap();

        let go = Deadline::after(Duration::from_secs(60));
        let mut seen = Vec::new();
        while !seen.ends_with(b"#GO2#") {
            seen.push(link.read_byte(go).await.unwrap().unwrap());
        }
        let second = read_window(&mut link, 3).await;
        link.write(format!("{}\n{}\n", second[1], second[2]).as_bytes())
            .await
            .unwrap();
        link
    });

    let mut session = TransferSession::new(StreamLink::new(near), config(3));
    assert_eq!(session.run(&image).await.unwrap(), image);
    drop(peer.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_missing_ready_token_times_out() {
    let image = gradient(2, 4);
    let (near, far) = tokio::io::duplex(1024);

    let peer = tokio::spawn(async move {
        let mut link = StreamLink::new(far);
        let first = read_window(&mut link, 3).await;
        link.write(&header_and_rows(2, 4, &first[..2])).await.unwrap();
        std::future::pending::<()>().await;
    });

    let cfg = SessionConfig {
        handshake_timeout: Duration::from_secs(30),
        ..config(3)
    };
    let mut session = TransferSession::new(StreamLink::new(near), cfg);
    let err = session.run(&image).await.unwrap_err();

    assert!(matches!(
        err,
        TransferError::HandshakeTimeout { ref token, after }
            if token == "#READY2#" && after == Duration::from_secs(30)
    ));
    assert_eq!(
        session.state(),
        SessionState::Failed {
            during: "AwaitReady"
        }
    );
    peer.abort();
}

// ── Timeouts and aborts ──────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_capture_timeout_reports_partial_rows() {
    let image = gradient(90, 90);
    let (near, far) = tokio::io::duplex(64 * 1024);

    let peer = tokio::spawn(async move {
        let mut link = StreamLink::new(far);
        let first = read_window(&mut link, 46).await;
        link.write(&header_and_rows(90, 90, &first[..10])).await.unwrap();
        std::future::pending::<()>().await;
    });

    let mut session = TransferSession::new(StreamLink::new(near), SessionConfig::default());
    let err = session.run(&image).await.unwrap_err();

    match err {
        TransferError::CaptureTimeout {
            stage,
            got,
            expected,
        } => {
            assert_eq!(stage, Phase::One);
            assert_eq!(got, 10);
            assert_eq!(expected, 45);
        }
        other => panic!("unexpected error: {other}"),
    }
    peer.abort();
}

#[tokio::test]
async fn test_peer_disconnect_during_capture_persists_nothing() {
    let image = gradient(4, 6);
    let dir = tempfile::tempdir().unwrap();
    let (near, far) = tokio::io::duplex(1024);

    let peer = tokio::spawn(async move {
        let mut link = StreamLink::new(far);
        let first = read_window(&mut link, 4).await;
        link.write(&header_and_rows(4, 6, &first[..1])).await.unwrap();
        // Dropping the link hangs up mid-capture.
    });

    let mut calls = 0;
    let target = dir.path().join("filtered.pgm");
    let mut writer = |grid: &ImageGrid| -> rowlink_core::Result<PathBuf> {
        calls += 1;
        write_pgm(grid, &target)
    };

    let mut session = TransferSession::new(StreamLink::new(near), config(4));
    let err = session.run_and_persist(&image, &mut writer).await.unwrap_err();
    peer.await.unwrap();

    assert!(matches!(err, TransferError::Transport(_)));
    assert_eq!(
        session.state(),
        SessionState::Failed {
            during: "CapturePhase1"
        }
    );
    assert_eq!(calls, 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_successful_session_persists_once() {
    let image = gradient(3, 4);
    let dir = tempfile::tempdir().unwrap();
    let (near, far) = tokio::io::duplex(1024);
    let peer = tokio::spawn(SimulatedPeer::new(3).serve(far));

    let mut calls = 0;
    let target = dir.path().join("filtered.pgm");
    let mut writer = |grid: &ImageGrid| -> rowlink_core::Result<PathBuf> {
        calls += 1;
        write_pgm(grid, &target)
    };

    let mut session = TransferSession::new(StreamLink::new(near), config(3));
    let (grid, path) = session.run_and_persist(&image, &mut writer).await.unwrap();
    peer.await.unwrap().unwrap();

    assert_eq!(calls, 1);
    assert_eq!(path, dir.path().join("filtered.pgm"));
    assert_eq!(rowlink_core::load_pgm(&path).unwrap(), grid);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_closes_link_and_fails() {
    let image = gradient(2, 4);
    let (near, far) = tokio::io::duplex(1024);

    let peer = tokio::spawn(async move {
        let mut link = StreamLink::new(far);
        let _ = read_window(&mut link, 3).await;
        std::future::pending::<()>().await;
    });

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        }
    });

    let mut session = TransferSession::new(StreamLink::new(near), config(3));
    let err = session.run_cancellable(&image, cancel).await.unwrap_err();

    assert!(matches!(err, TransferError::Cancelled));
    assert_eq!(
        session.state(),
        SessionState::Failed {
            during: "AwaitHeader"
        }
    );
    let mut link = session.into_link();
    assert!(link.write(b"1 2\n").await.is_err());
    peer.abort();
}

#[tokio::test]
async fn test_writer_trait_object() {
    struct Counting(usize);
    impl GridWriter for Counting {
        fn write_grid(&mut self, _grid: &ImageGrid) -> rowlink_core::Result<PathBuf> {
            self.0 += 1;
            Ok(PathBuf::from("memory"))
        }
    }

    let image = gradient(2, 4);
    let (near, far) = tokio::io::duplex(256);
    let peer = tokio::spawn(SimulatedPeer::new(3).serve(far));

    let mut writer = Counting(0);
    let dyn_writer: &mut dyn GridWriter = &mut writer;
    let mut session = TransferSession::new(StreamLink::new(near), config(3));
    session.run_and_persist(&image, dyn_writer).await.unwrap();
    peer.await.unwrap().unwrap();
    assert_eq!(writer.0, 1);
}
