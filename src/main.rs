//! CLI entry point for lab-logger
//!
//! Loads the runtime configuration and the device document, then polls every device
//! on the configured interval until SIGINT/SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! lab-logger --config /etc/lab-logger/config.toml
//! lab-logger --devices devices.json --dry-run     # log points instead of writing
//! lab-logger --once                               # one tick, then exit
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use lab_logger::config::{load_devices, RuntimeConfig, DEFAULT_CONFIG_PATH};
use lab_logger::scheduler::Scheduler;
use lab_logger::writer::{BatchWriter, FlushOutcome, InfluxSink, LogSink, PointSink, RetryPolicy};
use lab_logger::{build_pollers, logging};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "lab-logger", version)]
#[command(about = "Telemetry collector for laboratory instruments", long_about = None)]
struct Cli {
    /// Runtime configuration file (TOML)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Device document, overriding `[devices] config_path`
    #[arg(long)]
    devices: Option<PathBuf>,

    /// Log line protocol instead of writing to the database
    #[arg(long)]
    dry_run: bool,

    /// Run a single tick, flush, and exit
    #[arg(long)]
    once: bool,

    /// Log level, overriding `[logging] level`
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = RuntimeConfig::load_from(&cli.config)
        .with_context(|| format!("loading runtime configuration {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
        config.validate()?;
    }
    logging::init_from_config(&config.logging).map_err(anyhow::Error::msg)?;

    let devices_path = match cli.devices {
        Some(path) => path,
        None => relative_to(&cli.config, &config.devices.config_path),
    };
    let default_timeout = Duration::from_secs_f64(config.devices.default_timeout_secs);
    let devices = load_devices(&devices_path, default_timeout)
        .with_context(|| format!("loading device document {}", devices_path.display()))?;
    let pollers = build_pollers(devices, config.devices.reconnect_threshold)?;

    let sink: Arc<dyn PointSink> = if cli.dry_run {
        Arc::new(LogSink)
    } else {
        Arc::new(InfluxSink::new(&config.database)?)
    };
    info!(
        devices = pollers.len(),
        interval_secs = config.update.interval_secs,
        sink = sink.name(),
        "Lab logger starting"
    );
    let writer = BatchWriter::new(
        sink,
        RetryPolicy::from(&config.writer),
        config.database.precision,
    );
    let scheduler = Scheduler::new(pollers, writer, config.interval());

    if cli.once {
        return run_once(&scheduler).await;
    }

    let (stop, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = stop.send(true);
    });
    scheduler.run(stop_rx).await;
    Ok(())
}

/// Single tick as a connectivity check: fails when a device or the write failed.
async fn run_once(scheduler: &Scheduler) -> Result<()> {
    let report = scheduler.run_once().await;
    let mut failed = 0;
    for outcome in &report.outcomes {
        if outcome.errors.is_empty() {
            info!(device = %outcome.device, readings = outcome.readings.len(), "Device OK");
        } else {
            failed += 1;
            warn!(
                device = %outcome.device,
                readings = outcome.readings.len(),
                errors = %outcome.error_summary(),
                "Device reported errors"
            );
        }
    }
    if let FlushOutcome::Dropped { error, .. } = &report.flush {
        error!(error = %error, "Write failed");
        bail!("writing {} readings failed: {}", report.reading_count(), error);
    }
    if failed > 0 {
        bail!("{} of {} devices reported errors", failed, report.outcomes.len());
    }
    Ok(())
}

/// A relative device document path is taken relative to the runtime configuration.
fn relative_to(config_file: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match config_file.parent() {
        Some(dir) => dir.join(path),
        None => path.to_path_buf(),
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = term.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, only SIGINT stops the logger");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C");
    }
}
