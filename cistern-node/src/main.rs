//! Cistern Node - CLI for the device driver
//!
//! Brings up an in-process broker with a fleet of simulated controllers,
//! runs one discovery session and exercises the first new device.
//!
//! # Usage
//!
//! ```bash
//! # Five devices, none known yet
//! cistern-node --client backend
//!
//! # Ten devices, three already stored, two probe workers
//! cistern-node --client backend --devices 10 --existing 3 --workers 2
//!
//! # Longer window, verbose logging
//! CISTERN_WINDOW_MS=3000 cistern-node --log-level debug
//! ```

use std::sync::Arc;
use std::time::Duration;

use cistern_core::{CancellationToken, LocalBroker};
use cistern_driver::protocol::ComponentKind;
use cistern_driver::{
    build_descriptor, Announcement, DeviceConfig, DeviceSpec, DeviceStore, DiscoveryOptions, Driver,
    DriverConfig, Fleet, MemoryStore,
};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Cistern device discovery node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Client identity on the transport (random if not given)
    #[arg(short, long, env = "CISTERN_CLIENT")]
    client: Option<String>,

    /// Base topic for this backend
    #[arg(long, env = "CISTERN_BASE_TOPIC", default_value = "cistern")]
    base_topic: String,

    /// Number of simulated devices
    #[arg(short, long, default_value = "5")]
    devices: usize,

    /// How many of them are already stored
    #[arg(long, default_value = "0")]
    existing: usize,

    /// Discovery window in milliseconds
    #[arg(long, env = "CISTERN_WINDOW_MS", default_value = "1000")]
    window_ms: u64,

    /// Maximum concurrent probes
    #[arg(short, long, env = "CISTERN_WORKERS", default_value = "4")]
    workers: usize,

    /// Announcement intake buffer
    #[arg(long, default_value = "64")]
    buffer: usize,

    /// Simulated device reply delay in milliseconds
    #[arg(long, default_value = "20")]
    reply_delay_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client = args
        .client
        .clone()
        .unwrap_or_else(|| format!("node-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));

    let config = DriverConfig::new(client.as_str())
        .with_base_topic(args.base_topic.as_str())
        .with_discovery_window(Duration::from_millis(args.window_ms))
        .with_discovery_workers(args.workers)
        .with_discovery_buffer(args.buffer);

    info!(
        "Cistern node \"{}\" starting: {} devices ({} known), window {}ms, {} workers",
        client, args.devices, args.existing, args.window_ms, args.workers
    );

    // Simulated fleet
    let broker = LocalBroker::new();
    let mut fleet = Fleet::new(broker.clone(), config.topics.command_topic());
    for i in 0..args.devices {
        let spec = DeviceSpec::new(format!("tank-{}", i + 1))
            .with_name(format!("Tank {}", i + 1))
            .with_switch(Some("Inlet valve"))
            .with_switch(Some("Drain pump"))
            .with_sensor(ComponentKind::Temperature, Some("Water"))
            .with_sensor(ComponentKind::Flood, None)
            .with_reply_delay(Duration::from_millis(args.reply_delay_ms))
            .with_jitter(Duration::from_millis(args.reply_delay_ms));
        fleet.spawn(spec).await?;
    }

    // Store with the already-known devices
    let store = Arc::new(MemoryStore::new());
    for device in fleet.devices().iter().take(args.existing) {
        let descriptor = build_descriptor(
            &config.driver_name,
            &Announcement::new(device.id()),
            &DeviceConfig::default(),
        );
        store.create_device(&descriptor).await?;
    }

    let driver = Driver::new(config, Arc::new(broker.client(client.as_str())), store.clone());

    let ctx = CancellationToken::new();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            interrupt.cancel();
        }
    });

    driver.start(&ctx).await?;

    let result = driver.discover_devices(&ctx, DiscoveryOptions::default()).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if let Some(tag) = result.discovered_tags.first() {
        let device = tag.trim_start_matches("device.");
        let switched = driver.set_switch(&ctx, device, 0, true).await?;
        let status = driver.get_status(&ctx, device).await?;
        info!(
            "{}: inlet valve on (was {}), status {}",
            device,
            if switched.was_on { "on" } else { "off" },
            status
        );
    }

    info!(
        "Store holds {} devices; peak concurrent probes {}",
        store.len(),
        fleet.stats().peak_in_flight()
    );

    driver.stop(&ctx).await?;
    Ok(())
}
