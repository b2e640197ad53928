//! Modbus master.
//!
//! Polls one Modbus slave (TCP or RTU/serial) and appends the decoded register
//! values to daily CSV files.

use anyhow::{Context, Result};
use clap::Parser;
use modbus_master::config::HostConfig;
use modbus_master::fault_log::FileFaultLog;
use modbus_master::settings::MasterSettings;
use modbus_master::sink::CsvResultSink;
use modbus_master::transport::ModbusTransport;
use modbus_master::{PollingCycle, Scheduler};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Modbus master polling holding or input registers.
#[derive(Parser, Debug)]
#[command(name = "modbus-master")]
#[command(about = "Polls a Modbus device and records register values to CSV")]
#[command(version)]
struct Args {
    /// Path to host configuration file (JSON5 format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the settings file path.
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Override the CSV output directory.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Poll once and exit, ignoring the configured period.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load host configuration
    let mut config = match &args.config {
        Some(path) => HostConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => HostConfig::default(),
    };
    if let Some(settings_file) = args.settings {
        config.settings_file = settings_file;
    }
    if let Some(output_dir) = args.output_dir {
        config.output_dir = output_dir;
    }

    // Initialize logging
    let log_config = config.logging.with_level_override(args.log_level.as_deref());
    modbus_master_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting modbus-master");

    let mut settings = MasterSettings::load(&config.settings_file)
        .with_context(|| format!("Invalid settings file {:?}", config.settings_file))?;
    if args.once {
        settings.period = 0;
    }

    info!(
        settings = %config.settings_file.display(),
        transport = %settings.transport,
        device_id = settings.device_id,
        groups = settings.groups.len(),
        period_secs = settings.period,
        "Loaded settings"
    );

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("Cannot create output directory {:?}", config.output_dir))?;

    let cycle = PollingCycle::new(
        Arc::new(ModbusTransport::new(config.register_kind)),
        Arc::new(CsvResultSink::new(
            &config.output_dir,
            settings.value_addresses(),
        )),
        Arc::new(FileFaultLog::new(
            &config.fault_log,
            std::io::stderr().is_terminal(),
        )),
    );
    let scheduler = Scheduler::new(cycle);

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let summary = scheduler.run(&settings, shutdown_rx).await?;

    info!(
        cycles = summary.cycles,
        unavailable = summary.unavailable,
        failed_groups = summary.failed_groups,
        "Modbus master stopped"
    );

    Ok(())
}

async fn wait_for_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = sigterm() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
