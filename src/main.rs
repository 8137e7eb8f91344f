//! Irrigation kernel entry point: loads process configuration, initializes
//! GPIO, wires the façade, and serves the HTTP command surface until a
//! shutdown signal arrives.
//!
//! Safety features:
//! - Signal handler: SIGTERM/SIGINT → all zones off before exit.
//! - Power-on recovery: run-state document always reset to idle at boot,
//!   regardless of what an unclean shutdown left behind.
//! - A boot-sequence failure triggers a process restart after a 10s settle,
//!   the userspace equivalent of a hard device reset.

mod actuator;
mod clock;
mod config;
mod connectivity;
mod error;
mod executor;
mod gpio;
mod kernel;
mod logsink;
mod scheduler;
mod store;
mod web;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use clock::SystemClock;
use gpio::{GpioDriver, MockGpio};
use kernel::{Kernel, EXIT_CODE_RESTART_REQUESTED};
use logsink::{LogSink, LogSinkLayer};

#[cfg(feature = "gpio")]
use gpio::real::RppalGpio;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "irrigation.toml".to_string());
    let cfg = config::load(&config_path)?;

    let log = LogSink::new(cfg.data_dir.clone(), Arc::new(SystemClock));
    log.load().await;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(LogSinkLayer::new(Arc::clone(&log)))
        .init();

    if let Err(e) = run(&cfg, log).await {
        error!("boot sequence failed, resetting in 10s: {e:#}");
        tokio::time::sleep(Duration::from_secs(10)).await;
        std::process::exit(EXIT_CODE_RESTART_REQUESTED);
    }

    Ok(())
}

async fn run(cfg: &config::Config, log: Arc<LogSink>) -> Result<()> {
    let clock = Arc::new(SystemClock);
    let gpio = build_gpio();

    let kernel = Kernel::new(cfg.data_dir.clone(), gpio, clock, log).await;
    info!(data_dir = %cfg.data_dir, port = cfg.web_port, "kernel ready");

    tokio::select! {
        _ = web::serve(Arc::clone(&kernel), cfg.web_port) => {
            warn!("web server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    kernel.stop_all().await;
    info!("all zones stopped, shutdown complete");
    Ok(())
}

#[cfg(feature = "gpio")]
fn build_gpio() -> Arc<dyn GpioDriver> {
    match RppalGpio::new() {
        Ok(driver) => Arc::new(driver),
        Err(e) => {
            warn!("gpio init failed, falling back to mock driver: {e}");
            Arc::new(MockGpio::new())
        }
    }
}

#[cfg(not(feature = "gpio"))]
fn build_gpio() -> Arc<dyn GpioDriver> {
    Arc::new(MockGpio::new())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = &mut ctrl_c => {},
        _ = sigterm.recv() => {},
    }
}
