//! nav-beacon - turn-by-turn instructions pushed to a BLE display
//!
//! Follows a route fetched from a directions service, watches the vehicle
//! position, and writes the next maneuver to a small peripheral whenever the
//! vehicle comes within range of a step.
//!
//! Module structure:
//! - `domain/` - Core types (Coordinate, RouteStep, OutboundMessage, polyline)
//! - `io/` - External interfaces (radio, session, route provider, position sources)
//! - `services/` - Proximity matching, dispatcher, route refresher
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use nav_beacon::domain::RouteStepTable;
use nav_beacon::infra::{Config, Metrics, PositionSource, RadioBackend};
use nav_beacon::io::radio::{GattTarget, Radio};
use nav_beacon::io::{
    create_session, start_position_listener, GpsReader, RouteProvider, SessionConfig, SimRadio,
    SimRadioConfig,
};
use nav_beacon::services::{DispatcherConfig, NotificationDispatcher, RouteRefresher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// nav-beacon - route proximity notifications for a BLE display
#[derive(Parser, Debug)]
#[command(name = "nav-beacon", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Destination ("lat,lon" or place name), overrides route.destination
    #[arg(short, long)]
    destination: Option<String>,
}

/// Grace period for the session to release the radio on shutdown
const SESSION_TEARDOWN_GRACE: Duration = Duration::from_secs(3);

async fn build_radio(config: &Config) -> Result<Arc<dyn Radio>, Box<dyn std::error::Error>> {
    match config.radio_backend() {
        RadioBackend::Sim => {
            let radio = SimRadio::new(SimRadioConfig {
                device_name: config.device_name().to_string(),
                gatt: GattTarget {
                    service: config.service_uuid(),
                    characteristic: config.characteristic_uuid(),
                },
                ..SimRadioConfig::default()
            });
            info!(device = %config.device_name(), "radio_backend_sim");
            Ok(Arc::new(radio))
        }
        #[cfg(feature = "ble")]
        RadioBackend::Ble => {
            let radio = nav_beacon::io::BleRadio::new().await?;
            info!("radio_backend_ble");
            Ok(Arc::new(radio))
        }
        #[cfg(not(feature = "ble"))]
        RadioBackend::Ble => {
            Err("peripheral.backend = \"ble\" requires building with --features ble".into())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Default: INFO, use RUST_LOG=debug for per-tick visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "nav-beacon starting");

    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref());
    if let Some(destination) = args.destination {
        config = config.with_destination(destination);
    }

    info!(
        config_file = %config.config_file(),
        destination = ?config.destination(),
        route_base_url = %config.route_base_url(),
        dispatch_interval_secs = %config.dispatch_interval_secs(),
        threshold_m = %config.threshold_m(),
        dedupe_repeats = %config.dedupe_repeats(),
        position_source = ?config.position_source(),
        radio_backend = ?config.radio_backend(),
        device_name = %config.device_name(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());
    let table = RouteStepTable::new();

    // Peripheral session
    let radio = build_radio(&config).await?;
    let (session, peripheral) =
        create_session(radio, SessionConfig::from_config(&config), metrics.clone());
    let session_shutdown = shutdown_rx.clone();
    let session_task = tokio::spawn(async move {
        peripheral.run(session_shutdown).await;
    });

    // Dispatcher (position consumer)
    let dispatcher = NotificationDispatcher::new(
        table.clone(),
        session,
        DispatcherConfig::from_config(&config),
        metrics.clone(),
    );
    let position_watch = dispatcher.watch_position();

    // Route refresher
    let provider = RouteProvider::from_config(&config)?;
    let refresher = RouteRefresher::new(
        Arc::new(provider),
        table,
        config.destination().map(str::to_string),
        config.route_refresh_interval_secs(),
        metrics.clone(),
    );
    let refresher_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        refresher.run(position_watch, refresher_shutdown).await;
    });

    // Position source (bounded for backpressure)
    let (position_tx, position_rx) = mpsc::channel(256);
    match config.position_source() {
        PositionSource::Tcp => {
            let port = config.position_tcp_port();
            let listener_shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = start_position_listener(port, position_tx, listener_shutdown).await {
                    error!(error = %e, "position_listener_error");
                }
            });
        }
        PositionSource::Serial => {
            let reader = GpsReader::new(&config);
            let reader_shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                reader.run(position_tx, reader_shutdown).await;
            });
        }
    }

    // Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_device = config.device_name().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = nav_beacon::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_device,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Periodic metrics log
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Run dispatcher until shutdown
    dispatcher.run(position_rx, shutdown_rx).await;

    // Let the session stop scanning / release the link before exiting
    if tokio::time::timeout(SESSION_TEARDOWN_GRACE, session_task).await.is_err() {
        error!("session_teardown_timeout");
    }

    metrics.report().log();
    info!("nav-beacon shutdown complete");
    Ok(())
}
