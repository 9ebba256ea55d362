//! zone_monitor - Subscribe to person-detection messages and track zone occupancy.
//!
//! Modes:
//! 1. Daemon (default): persistent subscription, periodic status line until Ctrl-C
//! 2. `--once`: fetch a single message with a timeout, print the zone summary, exit
//! 3. `--demo`: load the built-in five-person batch without touching the broker
//!
//! Broker, topic, grid and buffer settings come from `$ZONE_MONITOR_CONFIG`
//! and the environment; the flags below override them.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use zone_monitor::{
    demo_batch, FetchOutcome, IngestionController, MonitorConfig, MqttTransport, Session,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Track person detections per grid zone from an MQTT topic"
)]
struct Args {
    /// MQTT broker address (overrides config).
    #[arg(long)]
    broker: Option<String>,

    /// Detection topic (overrides config).
    #[arg(long)]
    topic: Option<String>,

    /// Fetch one message and exit.
    #[arg(long, env = "ZONE_MONITOR_ONCE")]
    once: bool,

    /// Timeout for --once in milliseconds (overrides config).
    #[arg(long)]
    fetch_timeout_ms: Option<u64>,

    /// Load the demonstration batch instead of connecting.
    #[arg(long, conflicts_with = "once")]
    demo: bool,

    /// Seconds between status lines in daemon mode.
    #[arg(long, env = "ZONE_MONITOR_STATUS_INTERVAL", default_value_t = 10)]
    status_interval: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = MonitorConfig::load().context("load monitor config")?;
    if let Some(broker) = &args.broker {
        config.mqtt.broker_addr = broker.clone();
    }
    if let Some(topic) = &args.topic {
        config.mqtt.topic = topic.clone();
    }
    if let Some(timeout) = args.fetch_timeout_ms {
        config.fetch_timeout = Duration::from_millis(timeout);
    }

    let broker = config.broker_settings()?;
    log::info!("Zone monitor starting");
    log::info!("  MQTT broker: {}", broker.endpoint);
    log::info!("  Topic: {}", broker.topic);
    log::info!(
        "  Grid: {}x{} zones over {}x{} px",
        config.grid.width,
        config.grid.height,
        config.frame.width,
        config.frame.height
    );

    let session = Arc::new(Session::new(config.session_settings()));
    let controller = IngestionController::new(
        MqttTransport::new(),
        Arc::clone(&session),
        broker.clone(),
        config.controller_settings(),
    );

    if args.demo {
        controller.inject_synthetic_batch(demo_batch().detections);
        print_summary(&controller);
        return Ok(());
    }

    if args.once {
        return match controller.fetch()? {
            FetchOutcome::Message(batch) => {
                if let Some(total) = batch.total_people() {
                    log::info!("Sensor reports {} people", total);
                }
                print_summary(&controller);
                Ok(())
            }
            FetchOutcome::Timeout => {
                log::warn!("No detection message within {:?}", config.fetch_timeout);
                Ok(())
            }
        };
    }

    run_daemon(&controller, broker, Duration::from_secs(args.status_interval.max(1)))
}

fn run_daemon(
    controller: &IngestionController<MqttTransport>,
    broker: zone_monitor::BrokerSettings,
    status_interval: Duration,
) -> Result<()> {
    controller.start_session(broker)?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("install Ctrl-C handler")?;

    log::info!("Waiting for detections (Ctrl-C to stop)...");
    loop {
        match rx.recv_timeout(status_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => print_summary(controller),
        }
    }

    log::info!("Shutdown signal received, disconnecting...");
    controller.stop_session()?;
    Ok(())
}

fn print_summary(controller: &IngestionController<MqttTransport>) {
    let aggregation = controller.aggregation_state();
    let last_update = controller
        .last_update()
        .map(|at| at.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());

    log::info!(
        "link: {} (live: {}), last update: {}, people: {}, active zones: {}, density: {:.2}",
        controller.link_state(),
        controller.is_live(),
        last_update,
        aggregation.total_detections(),
        aggregation.active_zones(),
        aggregation.density()
    );
    for (zone, occupants) in aggregation.iter() {
        let people: Vec<String> = occupants
            .iter()
            .map(|d| format!("{} ({:.2})", d.id, d.confidence))
            .collect();
        log::info!("  zone {}: {}", zone, people.join(", "));
    }
}
