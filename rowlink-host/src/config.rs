//! Configuration for the rowlink host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rowlink_core::{
    DEFAULT_BUFFER_ROWS, DEFAULT_DIAGNOSTIC_MARKER, DEFAULT_GO_TOKEN, DEFAULT_READY_TOKEN,
    PGM_MAGIC, SessionConfig, SimulatedPeer,
};
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Link to the peer.
    pub link: LinkConfig,
    /// Protocol constants shared with the peer firmware.
    pub protocol: ProtocolConfig,
    /// Bounded waits.
    pub timeouts: TimeoutConfig,
    /// Where results are written.
    pub output: OutputConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Serial device path, `tcp://host:port`, or `sim`. Empty to pick a
    /// serial port at startup.
    pub endpoint: String,
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Pause after opening a serial port; many boards reset on open.
    pub startup_delay_ms: u64,
}

/// Protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Rows the peer can buffer at once.
    pub buffer_rows: usize,
    /// Image side length that needs no confirmation.
    pub expected_size: usize,
    pub magic: String,
    pub diagnostic_marker: String,
    pub ready_token: String,
    pub go_token: String,
}

/// Timeout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub header_secs: u64,
    /// Per phase.
    pub capture_secs: u64,
    pub handshake_secs: u64,
    pub settle_ms: u64,
    /// Budget for one streamed frame in listen mode.
    pub frame_secs: u64,
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for filtered images; created on demand.
    pub dir: PathBuf,
    /// File name prefix, followed by a timestamp.
    pub prefix: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            baud_rate: 115_200,
            startup_delay_ms: 2_000,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            buffer_rows: DEFAULT_BUFFER_ROWS,
            expected_size: 90,
            magic: PGM_MAGIC.into(),
            diagnostic_marker: DEFAULT_DIAGNOSTIC_MARKER.into(),
            ready_token: DEFAULT_READY_TOKEN.into(),
            go_token: DEFAULT_GO_TOKEN.into(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            header_secs: 20,
            capture_secs: 20,
            handshake_secs: 30,
            settle_ms: 50,
            frame_secs: 30,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("filtered"),
            prefix: "filtered_".into(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

/// Where the loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    /// No file at the path; defaults apply.
    Missing,
    /// The file did not parse; defaults apply.
    Invalid(String),
}

impl ConfigSource {
    pub fn log(&self, path: &Path) {
        match self {
            Self::File => tracing::info!("config loaded from {}", path.display()),
            Self::Missing => tracing::info!("no config at {}; using defaults", path.display()),
            Self::Invalid(e) => {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display())
            }
        }
    }
}

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    ///
    /// Nothing is logged here: `load` runs before tracing is installed, so
    /// the caller reports the returned [`ConfigSource`] once it is.
    pub fn load(path: &Path) -> (Self, ConfigSource) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, ConfigSource::File),
                Err(e) => (Self::default(), ConfigSource::Invalid(e.to_string())),
            },
            Err(_) => (Self::default(), ConfigSource::Missing),
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Protocol parameters for one transfer session.
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            buffer_rows: self.protocol.buffer_rows,
            magic: self.protocol.magic.clone(),
            diagnostic_marker: self.protocol.diagnostic_marker.clone(),
            ready_token: self.protocol.ready_token.clone(),
            go_token: self.protocol.go_token.clone(),
            header_timeout: Duration::from_secs(self.timeouts.header_secs),
            capture_timeout: Duration::from_secs(self.timeouts.capture_secs),
            handshake_timeout: Duration::from_secs(self.timeouts.handshake_secs),
            settle_delay: Duration::from_millis(self.timeouts.settle_ms),
        }
    }

    /// An in-process peer speaking the same protocol constants.
    pub fn to_simulated_peer(&self) -> SimulatedPeer {
        SimulatedPeer {
            ready_token: self.protocol.ready_token.clone(),
            go_token: self.protocol.go_token.clone(),
            ..SimulatedPeer::new(self.protocol.buffer_rows)
        }
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.link.startup_delay_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.frame_secs)
    }
}

// ── Tests ────────────────────────────────────────────────────────
