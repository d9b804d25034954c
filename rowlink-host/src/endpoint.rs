//! Where the peer lives, and how to open a link to it.
//!
//! ```text
//! /dev/ttyACM0, COM3     serial port
//! tcp://host:port        TCP socket (serial bridge, networked board)
//! sim                    in-process identity peer
//! ```

use std::fmt;
use std::io;
use std::str::FromStr;

use rowlink_core::{BoxedLink, Result, StreamLink, TransferError};
use tokio::net::TcpStream;
use tokio_serial::{SerialPortBuilderExt, SerialPortType};
use tracing::{info, warn};

use crate::config::HostConfig;

/// In-memory buffer between the host and the simulated peer.
const SIM_PIPE_CAPACITY: usize = 64 * 1024;

const TCP_SCHEME: &str = "tcp://";

// ── Endpoint ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Serial(String),
    Tcp(String),
    Simulated,
}

impl FromStr for Endpoint {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TransferError::Configuration("empty endpoint".into()));
        }
        if s.eq_ignore_ascii_case("sim") {
            return Ok(Self::Simulated);
        }
        match s.strip_prefix(TCP_SCHEME) {
            Some("") => Err(TransferError::Configuration(format!(
                "endpoint {s:?} is missing host:port"
            ))),
            Some(addr) => Ok(Self::Tcp(addr.to_string())),
            None => Ok(Self::Serial(s.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial(path) => write!(f, "{path}"),
            Self::Tcp(addr) => write!(f, "{TCP_SCHEME}{addr}"),
            Self::Simulated => write!(f, "sim"),
        }
    }
}

// ── Port discovery ───────────────────────────────────────────────

/// A serial port found on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

impl fmt::Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.description)
    }
}

/// Enumerate serial ports.
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = tokio_serial::available_ports().map_err(io::Error::from)?;
    Ok(ports
        .into_iter()
        .map(|p| PortInfo {
            description: describe(&p.port_type),
            name: p.port_name,
        })
        .collect())
}

fn describe(kind: &SerialPortType) -> String {
    match kind {
        SerialPortType::UsbPort(usb) => {
            let label = [usb.manufacturer.as_deref(), usb.product.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            if label.is_empty() {
                format!("USB {:04x}:{:04x}", usb.vid, usb.pid)
            } else {
                label
            }
        }
        SerialPortType::PciPort => "PCI".into(),
        SerialPortType::BluetoothPort => "Bluetooth".into(),
        SerialPortType::Unknown => "n/a".into(),
    }
}

/// Decide which endpoint to use.
///
/// A configured endpoint wins. Otherwise a single serial port is used
/// directly, and `select` picks among several.
pub fn resolve<F>(configured: &str, ports: &[PortInfo], select: F) -> Result<Endpoint>
where
    F: FnOnce(&[PortInfo]) -> Option<usize>,
{
    if !configured.trim().is_empty() {
        return configured.parse();
    }
    match ports {
        [] => Err(TransferError::Configuration(
            "no serial ports found; pass --port or --simulate".into(),
        )),
        [only] => {
            info!("using the only serial port: {only}");
            Ok(Endpoint::Serial(only.name.clone()))
        }
        _ => match select(ports).and_then(|i| ports.get(i)) {
            Some(port) => Ok(Endpoint::Serial(port.name.clone())),
            None => Err(TransferError::Configuration("no serial port selected".into())),
        },
    }
}

// ── Opening ──────────────────────────────────────────────────────

/// Open a link to `endpoint`.
///
/// For `sim`, the peer is spawned on the runtime and serves exactly one
/// session.
pub async fn open(endpoint: &Endpoint, config: &HostConfig) -> Result<BoxedLink> {
    match endpoint {
        Endpoint::Serial(path) => {
            let port = tokio_serial::new(path, config.link.baud_rate)
                .open_native_async()
                .map_err(io::Error::from)?;
            info!("opened {path} at {} baud", config.link.baud_rate);
            // Boards that reset on open need time before they listen.
            tokio::time::sleep(config.startup_delay()).await;
            Ok(StreamLink::new(port).boxed())
        }
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            info!("connected to {addr}");
            Ok(StreamLink::new(stream).boxed())
        }
        Endpoint::Simulated => {
            let (near, far) = tokio::io::duplex(SIM_PIPE_CAPACITY);
            let peer = config.to_simulated_peer();
            tokio::spawn(async move {
                if let Err(e) = peer.serve(far).await {
                    warn!("simulated peer stopped: {e}");
                }
            });
            info!("using simulated peer");
            Ok(StreamLink::new(near).boxed())
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
