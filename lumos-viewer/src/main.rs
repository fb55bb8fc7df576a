//! Lumos viewer entry point.
//!
//! ```text
//! lumos-viewer                                  Connect with defaults
//! lumos-viewer --config <path>                 Use custom config TOML
//! lumos-viewer --kind udp --endpoint '*' --number 2368
//! lumos-viewer --gen-config                    Dump default config and exit
//! lumos-viewer --write-config                  Save default config to --config path
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lumos_core::TransportKind;
use lumos_viewer::config::ViewerConfig;
use lumos_viewer::controller::Controller;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "lumos-viewer", about = "Lumos LiDAR scan viewer")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "lumos-viewer.toml")]
    config: PathBuf,

    /// Transport (overrides config): tcp, udp or serial.
    #[arg(short, long)]
    kind: Option<TransportKind>,

    /// Sensor address or serial port name (overrides config).
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Port number or baud rate (overrides config).
    #[arg(short, long)]
    number: Option<u32>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Write the default configuration to the `--config` path and exit.
    #[arg(long)]
    write_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ViewerConfig::default())?;
        println!("{text}");
        return Ok(());
    }
    if cli.write_config {
        ViewerConfig::write_default(&cli.config)?;
        println!("wrote {}", cli.config.display());
        return Ok(());
    }

    let mut config = ViewerConfig::load(&cli.config);
    if let Some(kind) = cli.kind {
        config.link.kind = kind;
    }
    if let Some(endpoint) = cli.endpoint {
        config.link.endpoint = endpoint;
    }
    if let Some(number) = cli.number {
        config.link.number = number;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("lumos-viewer v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "{} link to {}:{}",
        config.link.kind, config.link.endpoint, config.link.number
    );

    let mut controller = Controller::new(config)?;
    if !controller.connect().await {
        error!("could not connect to the sensor");
    }

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
        }
        on_signal.cancel();
    });

    controller.run(shutdown).await;
    info!(
        "{} samples decoded, {} points buffered",
        controller.view().samples(),
        controller.cloud().len()
    );
    Ok(())
}
