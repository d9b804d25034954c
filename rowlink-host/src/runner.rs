//! Ties loading, confirmation, the link and the session together.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Local;
use rowlink_core::{
    GridWriter, ImageGrid, LinkTransport, Result, TransferError, TransferSession, capture_frame,
    load_pgm, write_pgm,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::endpoint::{self, Endpoint, PortInfo};

// ── Console ──────────────────────────────────────────────────────

/// Interactive decisions the runner cannot make on its own.
#[async_trait]
pub trait Console: Send {
    /// Ask a yes/no question.
    async fn confirm(&mut self, question: &str) -> bool;

    /// Pick one of `ports` by index.
    async fn select_port(&mut self, ports: &[PortInfo]) -> Option<usize>;
}

/// Prompts on stdout and reads answers from stdin.
///
/// A pending prompt gives up as soon as `cancel` fires.
#[derive(Debug, Default)]
pub struct StdConsole {
    /// Answer every confirmation with yes.
    pub assume_yes: bool,
    pub cancel: CancellationToken,
}

impl StdConsole {
    async fn ask(&self, prompt: String) -> Option<String> {
        if self.cancel.is_cancelled() {
            return None;
        }
        // Detached: a read stuck on stdin must not block runtime shutdown.
        let (tx, rx) = oneshot::channel();
        std::thread::spawn(move || {
            let _ = tx.send(read_answer(&prompt));
        });
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                println!();
                None
            }
            answer = rx => answer.ok().flatten(),
        }
    }
}

fn read_answer(prompt: &str) -> Option<String> {
    print!("{prompt}");
    io::stdout().flush().ok()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer).ok()?;
    Some(answer.trim().to_string())
}

#[async_trait]
impl Console for StdConsole {
    async fn confirm(&mut self, question: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        self.ask(format!("{question} [y/N] "))
            .await
            .is_some_and(|a| a.eq_ignore_ascii_case("y") || a.eq_ignore_ascii_case("yes"))
    }

    async fn select_port(&mut self, ports: &[PortInfo]) -> Option<usize> {
        println!("Available serial ports:");
        for (i, port) in ports.iter().enumerate() {
            println!("  {}: {port}", i + 1);
        }
        let answer = self.ask(format!("Select port [1-{}]: ", ports.len())).await?;
        answer.parse::<usize>().ok()?.checked_sub(1)
    }
}

// ── Output ───────────────────────────────────────────────────────

/// Writes each grid to `<dir>/<prefix><YYYYmmdd_HHMMSS>.pgm`.
#[derive(Debug, Clone)]
pub struct TimestampedPgmWriter {
    dir: PathBuf,
    prefix: String,
}

impl TimestampedPgmWriter {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// First free file name for the current second.
    fn next_path(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let base = format!("{}{stamp}", self.prefix);
        let mut path = self.dir.join(format!("{base}.pgm"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{base}_{n}.pgm"));
            n += 1;
        }
        path
    }
}

impl GridWriter for TimestampedPgmWriter {
    fn write_grid(&mut self, grid: &ImageGrid) -> Result<PathBuf> {
        write_pgm(grid, &self.next_path())
    }
}

// ── Transfer ─────────────────────────────────────────────────────

/// How a run ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The filtered image was written here.
    Saved(PathBuf),
    /// The user declined to continue.
    Declined,
    /// Listen mode stopped after saving this many frames.
    Frames(usize),
}

/// Pick the endpoint from configuration, or by asking.
pub async fn choose_endpoint(config: &HostConfig, console: &mut dyn Console) -> Result<Endpoint> {
    let configured = config.link.endpoint.trim();
    if !configured.is_empty() {
        return configured.parse();
    }
    let ports = endpoint::list_ports()?;
    let choice = if ports.len() > 1 {
        console.select_port(&ports).await
    } else {
        None
    };
    endpoint::resolve(configured, &ports, |_| choice)
}

/// Filter `image_path` through the peer and save the result.
pub async fn transfer(
    image_path: &Path,
    config: &HostConfig,
    console: &mut dyn Console,
    cancel: CancellationToken,
) -> Result<Outcome> {
    let image = load_pgm(image_path)?;
    info!(
        "loaded {} ({}x{}, maxval {})",
        image_path.display(),
        image.width(),
        image.height(),
        image.maxval()
    );

    let expected = config.protocol.expected_size;
    if image.width() != expected || image.height() != expected {
        let question = format!(
            "Image is {}x{}, the peer expects {expected}x{expected}. Continue anyway?",
            image.width(),
            image.height()
        );
        let confirmed = console.confirm(&question).await;
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if !confirmed {
            info!("transfer declined");
            return Ok(Outcome::Declined);
        }
    }

    let endpoint = choose_endpoint(config, console).await;
    if cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    let endpoint = endpoint?;
    let link = tokio::select! {
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        link = endpoint::open(&endpoint, config) => link?,
    };

    let mut writer = TimestampedPgmWriter::new(&config.output.dir, &config.output.prefix);
    let mut session =
        TransferSession::new(link, config.to_session_config()).with_cancellation(cancel);
    let (_, path) = session.run_and_persist(&image, &mut writer).await?;
    Ok(Outcome::Saved(path))
}

// ── Listen ───────────────────────────────────────────────────────

/// Save every complete frame the peer streams until `frames` are saved
/// or `cancel` fires.
pub async fn listen(
    config: &HostConfig,
    console: &mut dyn Console,
    frames: Option<usize>,
    cancel: CancellationToken,
) -> Result<Outcome> {
    let endpoint = choose_endpoint(config, console).await;
    if cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    let endpoint = endpoint?;
    if endpoint == Endpoint::Simulated {
        return Err(TransferError::Configuration(
            "listen mode needs a device that streams frames".into(),
        ));
    }
    let mut link = tokio::select! {
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        link = endpoint::open(&endpoint, config) => link?,
    };

    let mut writer = TimestampedPgmWriter::new(&config.output.dir, &config.output.prefix);
    let result = listen_on(&mut link, config, &mut writer, frames, &cancel).await;
    if let Err(e) = link.close().await {
        debug!("closing link: {e}");
    }
    result.map(Outcome::Frames)
}

/// Frame loop over an open link. Returns the number of frames saved.
pub async fn listen_on<L, W>(
    link: &mut L,
    config: &HostConfig,
    writer: &mut W,
    frames: Option<usize>,
    cancel: &CancellationToken,
) -> Result<usize>
where
    L: LinkTransport + ?Sized,
    W: GridWriter + ?Sized,
{
    let session = config.to_session_config();
    let timeout = config.frame_timeout();
    let mut saved = 0;
    info!("listening for frames");

    while frames.is_none_or(|limit| saved < limit) {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                info!("listen stopped after {saved} frames");
                break;
            }
            frame = capture_frame(link, &session, timeout) => frame,
        };
        match frame {
            Ok(grid) => {
                let path = writer.write_grid(&grid)?;
                saved += 1;
                info!("frame {saved} saved to {}", path.display());
            }
            Err(e @ TransferError::MalformedImage { .. }) => warn!("skipping frame: {e}"),
            Err(e) if e.is_timeout() => debug!("no complete frame yet: {e}"),
            Err(e) => return Err(e),
        }
    }
    Ok(saved)
}

// ── Tests ────────────────────────────────────────────────────────
