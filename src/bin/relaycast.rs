//! Broadcast encoder daemon
//!
//! Loads the station configuration, starts auto-start slots and streams
//! until Ctrl-C.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relaycast::{audio::list_input_devices, AppConfig, AudioPipeline, SlotServices};

const STATS_INTERVAL: Duration = Duration::from_secs(30);

fn print_devices() {
    println!("\n=== Available Input Devices ===");
    let devices = list_input_devices();
    if devices.is_empty() {
        println!("  (none)");
    }
    for device in &devices {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  #{} {}{}", device.index, device.name, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}

fn load_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let path = path.or_else(|| AppConfig::default_path().filter(|p| p.is_file()));
    match path {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            AppConfig::load(&path).with_context(|| format!("loading {}", path.display()))
        }
        None => {
            tracing::warn!("No configuration file found, running without slots");
            Ok(AppConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config_path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--list-devices" => {
                print_devices();
                return Ok(());
            }
            "-h" | "--help" => {
                println!("usage: relaycast [--list-devices] [config.toml]");
                return Ok(());
            }
            other => config_path = Some(PathBuf::from(other)),
        }
    }

    tracing::info!("Starting relaycast {}", env!("CARGO_PKG_VERSION"));
    let config = load_config(config_path)?;

    let pipeline = Arc::new(
        AudioPipeline::from_config(&config, SlotServices::default())
            .context("building slots")?,
    );
    tracing::info!("{} slot(s) configured", pipeline.len());

    // Auto-start scheduler
    for slot in config.slots.iter().filter(|s| s.auto_start) {
        let pipeline = pipeline.clone();
        let (id, delay) = (slot.slot_id, Duration::from_secs(slot.auto_start_delay_sec as u64));
        tokio::spawn(async move {
            if !delay.is_zero() {
                tracing::info!("Slot {} auto-starts in {:?}", id, delay);
                tokio::time::sleep(delay).await;
            }
            pipeline.start_slot(id);
        });
    }

    let stats_pipeline = pipeline.clone();
    let stats_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            match serde_json::to_string(&stats_pipeline.all_stats()) {
                Ok(json) => tracing::info!("Stats: {}", json),
                Err(e) => tracing::warn!("Failed to serialize stats: {}", e),
            }
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("Shutting down");
    stats_task.abort();

    // Slot teardown joins threads; keep it off the async workers
    let shutdown = pipeline.clone();
    tokio::task::spawn_blocking(move || shutdown.stop_all())
        .await
        .context("stopping slots")?;

    Ok(())
}
