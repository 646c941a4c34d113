//! usb-topology
//!
//! Prints the USB device tree of this host, or keeps watching it and logs
//! devices as they come and go.

use anyhow::{Context, Result};
use clap::Parser;
use common::{LogFormat, setup_logging};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use usb_topology::config::TopologyConfig;
use usb_topology::{DeviceManager, ScanScheduler};

#[derive(Parser, Debug)]
#[command(name = "usb-topology")]
#[command(author, version, about = "Show and watch the USB device tree")]
#[command(long_about = "
Keeps an in-memory model of the USB devices attached to this host, rooted at
a virtual root hub, by periodically re-enumerating the busses.

EXAMPLES:
    # Print the current device tree
    usb-topology

    # Print the device tree as JSON
    usb-topology --json

    # Watch devices being plugged and unplugged
    usb-topology --watch --log-level debug

CONFIGURATION:
    The configuration file is looked up in the following order:
    1. Path specified with --config
    2. ~/.config/usb-topology/config.toml
    3. /etc/usb-topology/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Keep scanning and log topology changes until Ctrl+C
    #[arg(short, long)]
    watch: bool,

    /// Print the device tree as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log format (pretty, compact)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = TopologyConfig::default();
        let path = TopologyConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        TopologyConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        TopologyConfig::load_or_default()
    };

    // Use CLI log settings if specified, otherwise use config values
    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    TopologyConfig::validate_log_level(log_level)?;
    let log_format = args.log_format.unwrap_or(config.logging.format);

    setup_logging(log_level, log_format).context("Failed to setup logging")?;

    info!("usb-topology v{}", env!("CARGO_PKG_VERSION"));

    let manager = Arc::new(DeviceManager::with_libusb().context("Failed to initialize USB")?);

    let result = if args.watch {
        watch_mode(Arc::clone(&manager), &config).await
    } else {
        print_mode(&manager, args.json)
    };

    // Cleanup: the scheduler is stopped by now, so this is the last reference
    match Arc::try_unwrap(manager) {
        Ok(manager) => manager.dispose(),
        Err(_) => error!("USB device manager still in use at shutdown"),
    }

    result
}

/// Scan once and print the tree
fn print_mode(manager: &DeviceManager, json: bool) -> Result<()> {
    manager.first_scan().context("Failed to scan USB devices")?;

    let tree = manager.tree();
    if json {
        let output =
            serde_json::to_string_pretty(&tree).context("Failed to serialize device tree")?;
        println!("{}", output);
    } else if tree.is_empty() {
        println!("No USB devices found.");
    } else {
        print!("{}", tree);
    }

    Ok(())
}

/// Keep the topology up to date until Ctrl+C
async fn watch_mode(manager: Arc<DeviceManager>, config: &TopologyConfig) -> Result<()> {
    let scan_manager = Arc::clone(&manager);
    tokio::task::spawn_blocking(move || scan_manager.first_scan())
        .await
        .context("Initial scan panicked")?
        .context("Failed to scan USB devices")?;

    info!("{} USB device(s) connected", manager.len());

    let scheduler = if config.scanner.background {
        Some(
            ScanScheduler::start(Arc::clone(&manager), config.scanner.interval)
                .context("Failed to start USB scanner")?,
        )
    } else {
        info!("Background scanning disabled in configuration");
        None
    };

    info!("Press Ctrl+C to stop");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(e) => {
            error!("Error waiting for Ctrl+C: {}", e);
        }
    }

    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }

    print!("{}", manager.tree());
    Ok(())
}
