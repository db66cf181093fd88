mod bluetooth;
mod config;
mod database;
mod error;
mod models;
mod registry;
mod telemetry;
#[cfg(test)]
mod testing;
mod utils;

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use bluetooth::bluez::BluerRadio;
use bluetooth::connection::{ConnectionManager, StateTransition};
use bluetooth::radio::Radio;
use bluetooth::scanner::Scanner;
use config::AppConfig;
use database::{PostgresRegistry, PostgresSink};
use models::{ConnectionState, ScanStatus, VitalKind};
use registry::{DeviceRegistry, MemoryRegistry};
use telemetry::{LogSink, ReadingPipeline, TelemetryEmitter, TelemetryEvent, TelemetrySink};
use utils::{format_datetime, normalize_address};

/// Log everything the emitter fans out
async fn log_events(mut events: broadcast::Receiver<TelemetryEvent>) {
    loop {
        match events.recv().await {
            Ok(TelemetryEvent::ReadingStored(record)) => info!(
                "Stored #{} from {} at {}: {}",
                record.id,
                record.reading.device_address,
                format_datetime(&record.reading.observed_at),
                record.reading.measurement
            ),
            Ok(TelemetryEvent::ConnectionStatusChanged { address, status }) => {
                info!("{} is now {:?}", address, status)
            }
            Ok(TelemetryEvent::ScanStatusChanged(status)) => debug!("Scan status: {:?}", status),
            Ok(TelemetryEvent::DecodeFailed { address, error }) => {
                warn!("Undecodable notification from {}: {}", address, error)
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event log fell behind, skipped {} events", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn log_transitions(mut transitions: broadcast::Receiver<StateTransition>) {
    loop {
        match transitions.recv().await {
            Ok(t) => debug!(
                "{} -> {} ({} failed attempts)",
                t.address, t.state, t.attempt_count
            ),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Run a scan session every interval; a session ends on its own after its duration
async fn scan_loop(scanner: Scanner, config: AppConfig) {
    let mut ticker = interval(config.scan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if scanner.is_scanning().await {
            debug!("Previous scan session still running, skipping this interval");
            continue;
        }
        if let Err(e) = scanner.start_scan().await {
            error!("Scan failed to start: {}", e);
        }
    }
}

/// Addresses of every paired device of the polled kinds
async fn paired_addresses(registry: &dyn DeviceRegistry, kinds: &[VitalKind]) -> Vec<String> {
    let mut addresses = Vec::new();
    for kind in kinds {
        match registry.list_paired(*kind).await {
            Ok(devices) => addresses.extend(devices.iter().map(|device| normalize_address(&device.address))),
            Err(e) => error!("Failed to list paired {} devices: {}", kind, e),
        }
    }
    addresses
}

/// Wait for the first scan session, connect what it found, then start polling
async fn run(
    manager: ConnectionManager,
    scanner: Scanner,
    registry: Arc<dyn DeviceRegistry>,
    kinds: Vec<VitalKind>,
    mut events: broadcast::Receiver<TelemetryEvent>,
) {
    loop {
        match events.recv().await {
            Ok(TelemetryEvent::ScanStatusChanged(ScanStatus::Idle { .. })) => break,
            Ok(TelemetryEvent::ScanStatusChanged(ScanStatus::Error { .. })) => break,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    let in_range: Vec<String> = scanner
        .peripherals()
        .await
        .into_iter()
        .map(|peripheral| peripheral.address)
        .collect();
    info!("First scan found {} device(s) in range", in_range.len());

    for address in paired_addresses(registry.as_ref(), &kinds).await {
        if !in_range.contains(&address) || manager.state(&address).await != ConnectionState::Disconnected {
            continue;
        }
        match manager.connect(&address).await {
            Ok(()) => info!("Initial connection to {} established", address),
            Err(e) => warn!("Initial connection to {} failed: {}", address, e),
        }
    }

    manager.start().await;
    std::future::pending::<()>().await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match AppConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let (registry, sink): (Arc<dyn DeviceRegistry>, Arc<dyn TelemetrySink>) = match &config.database_url {
        Some(url) => {
            info!("Using PostgreSQL registry and sink");
            (Arc::new(PostgresRegistry::new(url)), Arc::new(PostgresSink::new(url)))
        }
        None => {
            info!("DATABASE_URL not set, using configured devices and logging sink");
            (
                Arc::new(MemoryRegistry::new(config.paired_devices.clone())),
                Arc::new(LogSink::default()),
            )
        }
    };

    let radio: Arc<dyn Radio> = match BluerRadio::new().await {
        Ok(radio) => Arc::new(radio),
        Err(e) => {
            error!("Failed to initialize Bluetooth adapter: {}", e);
            return Err(e.into());
        }
    };

    let emitter = TelemetryEmitter::spawn(sink);
    tokio::spawn(log_events(emitter.subscribe()));
    let startup_events = emitter.subscribe();
    let pipeline = ReadingPipeline::spawn(config.debounce_window, config.debounce_sweep, emitter.clone());
    let scanner = Scanner::new(radio.clone(), emitter.clone(), config.scan_duration);
    let manager = ConnectionManager::spawn(
        config.connection(),
        radio,
        scanner.clone(),
        registry.clone(),
        emitter,
        pipeline,
    );
    tokio::spawn(log_transitions(manager.subscribe_transitions()));

    info!("Starting vitals hub");
    let kinds = config.kinds.clone();
    let scans = tokio::spawn(scan_loop(scanner.clone(), config));

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    // Run until the shutdown signal
    tokio::select! {
        _ = run(manager.clone(), scanner.clone(), registry.clone(), kinds.clone(), startup_events) => {}
        result = &mut rx => {
            if result.is_err() {
                warn!("Shutdown signal unavailable, running until killed");
                std::future::pending::<()>().await;
            }
        }
    }

    info!("Program terminated by user. Shutting down.");
    scans.abort();
    scanner.stop_scan().await;

    for address in paired_addresses(registry.as_ref(), &kinds).await {
        let Some(snapshot) = manager.snapshot(&address).await else {
            continue;
        };
        if snapshot.state != ConnectionState::Connected {
            debug!(
                "{} is {} after {} failed attempts, nothing to disconnect",
                address, snapshot.state, snapshot.attempt_count
            );
            continue;
        }
        match snapshot.connected_at {
            Some(since) => info!("Disconnecting {}, connected since {}", address, format_datetime(&since)),
            None => info!("Disconnecting {}", address),
        }
        manager.disconnect(&address).await;
    }
    manager.stop().await;
    info!("All links closed. Exiting gracefully.");

    Ok(())
}
