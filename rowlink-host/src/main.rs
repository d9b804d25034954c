//! rowlink-host entry point.
//!
//! ```text
//! rowlink-host IMAGE                 Filter IMAGE through the peer
//! rowlink-host IMAGE --simulate      ... through an in-process identity peer
//! rowlink-host --listen [--frames N] Save frames a streaming peer emits
//! rowlink-host --list-ports          Show serial ports and exit
//! rowlink-host --gen-config          Write default config to stdout
//! rowlink-host --write-config        Write default config to --config path
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rowlink_host::config::HostConfig;
use rowlink_host::endpoint;
use rowlink_host::runner::{self, Outcome, StdConsole};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "rowlink-host",
    version,
    about = "Filter a PGM image on a row-limited peer over a serial link"
)]
struct Cli {
    /// Source image (PGM P2). Required unless --listen is given.
    image: Option<PathBuf>,

    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "rowlink.toml")]
    config: PathBuf,

    /// Serial device, tcp://host:port, or "sim".
    #[arg(short, long)]
    port: Option<String>,

    /// Use the in-process simulated peer.
    #[arg(long, conflicts_with = "port")]
    simulate: bool,

    /// Do not ask for confirmation.
    #[arg(short = 'y', long)]
    yes: bool,

    /// Directory for filtered images.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// List serial ports and exit.
    #[arg(long)]
    list_ports: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Write the default configuration to the --config path and exit.
    #[arg(long)]
    write_config: bool,

    /// Save frames streamed by the peer instead of running a transfer.
    #[arg(long, conflicts_with = "image")]
    listen: bool,

    /// Stop listening after this many saved frames.
    #[arg(long, requires = "listen")]
    frames: Option<usize>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&HostConfig::default())?;
        println!("{text}");
        return Ok(());
    }
    if cli.write_config {
        HostConfig::write_default(&cli.config)?;
        println!("Default configuration written to {}", cli.config.display());
        return Ok(());
    }

    // Load config, then let the command line override it.
    let (mut config, source) = HostConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.link.endpoint = port;
    }
    if cli.simulate {
        config.link.endpoint = "sim".into();
    }
    if let Some(dir) = cli.output_dir {
        config.output.dir = dir;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("rowlink-host v{}", env!("CARGO_PKG_VERSION"));
    source.log(&cli.config);

    if cli.list_ports {
        let ports = endpoint::list_ports()?;
        if ports.is_empty() {
            println!("No serial ports found.");
        }
        for port in &ports {
            println!("{port}");
        }
        return Ok(());
    }

    // Ctrl-C handler.
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Ctrl-C received, aborting");
            cancel.cancel();
        }
    });

    let mut console = StdConsole {
        assume_yes: cli.yes,
        cancel: cancel.clone(),
    };

    let outcome = if cli.listen {
        runner::listen(&config, &mut console, cli.frames, cancel).await?
    } else {
        let image = cli
            .image
            .ok_or("an IMAGE path is required unless --listen is given")?;
        runner::transfer(&image, &config, &mut console, cancel).await?
    };

    match outcome {
        Outcome::Saved(path) => println!("Filtered image saved to {}", path.display()),
        Outcome::Declined => println!("Aborted by user."),
        Outcome::Frames(n) => println!("Saved {n} frame(s)."),
    }
    Ok(())
}
