//! Binary entry point: wires the engine together and runs it with a minimal
//! signal-driven lifecycle. Owns no HTTP/MQTT surface — that remains a
//! collaborator concern (§6); this binary exists to demonstrate the engine
//! is runnable standalone, in the same spirit as the teacher's own
//! orchestration in its hub binary.

use anyhow::{Context, Result};
use irrigation_core::config::{
    load_garden_settings, load_hardware_config, load_schedule_document,
};
use irrigation_core::hardware::DefaultDriver;
use irrigation_core::pump::PumpCoupledDriver;
use irrigation_core::registry::Registry;
use irrigation_core::run_loop::RunLoop;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Bound on joining the run-loop task during shutdown (§5).
const SHUTDOWN_JOIN_TIMEOUT: StdDuration = StdDuration::from_secs(5);

#[cfg(feature = "gpio")]
fn build_driver(
    outputs: Vec<(irrigation_core::zone::ZoneId, String, irrigation_core::zone::Polarity)>,
) -> Result<DefaultDriver> {
    DefaultDriver::new(&outputs).context("failed to initialise GPIO driver")
}

#[cfg(not(feature = "gpio"))]
fn build_driver(
    outputs: Vec<(irrigation_core::zone::ZoneId, String, irrigation_core::zone::Polarity)>,
) -> Result<DefaultDriver> {
    let mut sim_outputs = Vec::with_capacity(outputs.len());
    for (zone, output_id, pol) in outputs {
        let pin: u8 = output_id
            .parse()
            .with_context(|| format!("output identifier '{output_id}' is not numeric"))?;
        sim_outputs.push((zone, pin, pol));
    }
    DefaultDriver::new(&sim_outputs).context("failed to initialise simulated driver")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let schedule_path = env::var("SCHEDULE_PATH").unwrap_or_else(|_| "schedule.toml".to_string());
    let settings_path = env::var("SETTINGS_PATH").unwrap_or_else(|_| "settings.toml".to_string());
    let hardware_path = env::var("HARDWARE_PATH").unwrap_or_else(|_| "hardware.toml".to_string());
    let snapshot_path: PathBuf = env::var("SNAPSHOT_PATH")
        .unwrap_or_else(|_| "active_runs.json".to_string())
        .into();

    let schedule = load_schedule_document(&schedule_path)
        .with_context(|| format!("failed to load schedule document: {schedule_path}"))?;
    let settings = load_garden_settings(&settings_path)
        .with_context(|| format!("failed to load garden settings: {settings_path}"))?;
    let hardware_cfg = load_hardware_config(&hardware_path)
        .with_context(|| format!("failed to load hardware configuration: {hardware_path}"))?;

    info!(
        zones = hardware_cfg.zone_count,
        pump = ?hardware_cfg.pump_zone(),
        "hardware configuration loaded"
    );

    let driver = build_driver(hardware_cfg.driver_outputs())?;
    let coupled = PumpCoupledDriver::new(Box::new(driver), hardware_cfg.pump_zone());

    let registry = Arc::new(Registry::new(Box::new(coupled), snapshot_path));
    let schedule = Arc::new(RwLock::new(schedule));
    let settings = Arc::new(RwLock::new(settings));

    let run_loop = Arc::new(RunLoop::new(
        Arc::clone(&registry),
        Arc::clone(&schedule),
        Arc::clone(&settings),
        None,
    ));

    let mut loop_handle = {
        let run_loop = Arc::clone(&run_loop);
        tokio::spawn(async move { run_loop.run().await })
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason: &str;
    tokio::select! {
        result = &mut loop_handle => {
            if let Err(e) = result {
                warn!(error = %e, "run loop task panicked");
            }
            exit_reason = "run loop exited";
        }
        _ = &mut ctrl_c => {
            exit_reason = "SIGINT";
        }
        _ = sigterm.recv() => {
            exit_reason = "SIGTERM";
        }
    }

    warn!(reason = exit_reason, "shutting down — releasing all zones");
    registry.orderly_shutdown().await;

    // The run loop may already have exited on its own (`exit_reason == "run
    // loop exited"`); otherwise it is still ticking and must be stopped
    // within a bounded join so it cannot re-energise a zone after
    // `release_all()` has run (§5).
    if exit_reason != "run loop exited" {
        loop_handle.abort();
        match tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, loop_handle).await {
            Ok(_) => info!("run loop task joined"),
            Err(_) => warn!(
                timeout_secs = SHUTDOWN_JOIN_TIMEOUT.as_secs(),
                "run loop task did not join within the shutdown bound, exiting anyway"
            ),
        }
    }

    info!("shutdown complete");
    Ok(())
}
