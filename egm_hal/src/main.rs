//! # EGM I/O Core Binary
//!
//! Polls the EGM I/O board, publishes input events and drives the
//! mechanical meters.
//!
//! # Usage
//!
//! ```bash
//! # Run with the simulation driver
//! egm_hal --config config/io.toml --simulate
//!
//! # Publish boot completed two seconds after startup
//! egm_hal --config config/io.toml -s --boot-delay-ms 2000
//!
//! # Verbose JSON logging
//! egm_hal --config config/io.toml -s -v --json
//! ```

use clap::Parser;
use egm_common::config::LogLevel;
use egm_common::consts::DEFAULT_CONFIG_PATH;
use egm_hal::core::IoCore;
use egm_hal::driver_registry::DriverRegistry;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// EGM I/O Core - input polling and mechanical meter actuation
#[derive(Parser, Debug)]
#[command(name = "egm_hal")]
#[command(version)]
#[command(about = "EGM I/O board poller and mechanical meter actuator")]
#[command(long_about = None)]
struct Args {
    /// Path to the board configuration file (io.toml).
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Force simulation driver
    #[arg(short = 's', long)]
    simulate: bool,

    /// Driver to load by name
    #[arg(short, long)]
    driver: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    /// Publish boot completed after this many milliseconds
    #[arg(long, value_name = "MS")]
    boot_delay_ms: Option<u64>,
}

fn main() {
    if let Err(e) = run() {
        error!("I/O core startup failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = IoCore::load_config(&args.config);
    let log_level = config
        .as_ref()
        .map(|config| config.shared.log_level)
        .unwrap_or_default();
    setup_tracing(&args, log_level);

    info!("EGM I/O Core v{} starting...", env!("CARGO_PKG_VERSION"));

    let registry = DriverRegistry::with_builtin_drivers();
    let driver_name = if args.simulate {
        info!("Simulation mode enabled");
        "simulation".to_string()
    } else if let Some(driver) = &args.driver {
        info!("Driver from CLI: {}", driver);
        driver.clone()
    } else {
        "simulation".to_string()
    };

    let mut core = IoCore::new(config?)?;

    let running = core.running_flag();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    })?;

    core.init(&registry, &driver_name)?;
    if let Err(e) = core.run(args.boot_delay_ms.map(Duration::from_millis)) {
        error!("Core loop error: {}", e);
    }
    core.shutdown()?;

    info!("EGM I/O Core shutdown complete");
    Ok(())
}

/// Setup tracing subscriber from `RUST_LOG`, the CLI and `[shared] log_level`.
fn setup_tracing(args: &Args, log_level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(args, log_level)));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// `--verbose` wins over the configured level.
fn default_directive(args: &Args, log_level: LogLevel) -> &'static str {
    if args.verbose {
        LogLevel::Debug.as_directive()
    } else {
        log_level.as_directive()
    }
}
