/// Bluetooth Low Energy discovery and the live peripheral table
use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::bluetooth::radio::{Advertisement, Radio, ScanEvent};
use crate::error::ScanError;
use crate::models::{Peripheral, ScanStatus};
use crate::telemetry::{TelemetryEmitter, TelemetryEvent};
use crate::utils::format_mac;

const DISCOVERY_CHANNEL_CAPACITY: usize = 256;

/// Raised whenever the live table gains or changes an entry
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    PeripheralDiscovered(Peripheral),
    PeripheralUpdated(Peripheral),
}

struct ScanSession {
    id: u64,
    task: JoinHandle<()>,
}

struct ScannerInner {
    radio: Arc<dyn Radio>,
    emitter: TelemetryEmitter,
    scan_duration: Duration,
    peripherals: RwLock<HashMap<String, Peripheral>>,
    session: Mutex<Option<ScanSession>>,
    next_session_id: Mutex<u64>,
    discovery_tx: broadcast::Sender<DiscoveryEvent>,
}

/// Drives time-bounded scan sessions and owns the live peripheral table
#[derive(Clone)]
pub struct Scanner {
    inner: Arc<ScannerInner>,
}

impl Scanner {
    pub fn new(radio: Arc<dyn Radio>, emitter: TelemetryEmitter, scan_duration: Duration) -> Self {
        let (discovery_tx, _) = broadcast::channel(DISCOVERY_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ScannerInner {
                radio,
                emitter,
                scan_duration,
                peripherals: RwLock::new(HashMap::new()),
                session: Mutex::new(None),
                next_session_id: Mutex::new(0),
                discovery_tx,
            }),
        }
    }

    /// Listen for discovered and updated peripherals
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.discovery_tx.subscribe()
    }

    /// Begin a scan session that stops by itself after the scan duration
    pub async fn start_scan(&self) -> Result<(), ScanError> {
        let mut session = self.inner.session.lock().await;
        if session.is_some() {
            return Err(ScanError::AlreadyScanning);
        }

        match self.inner.radio.is_powered().await {
            Ok(true) => {}
            Ok(false) => return Err(ScanError::RadioNotReady),
            Err(e) => {
                warn!("Failed to read adapter power state: {}", e);
                return Err(ScanError::RadioNotReady);
            }
        }

        // A fresh session starts from an empty table
        self.inner.peripherals.write().await.clear();

        let events = match self.inner.radio.scan_start().await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to start device discovery: {}", e);
                self.inner
                    .emitter
                    .emit_status(TelemetryEvent::ScanStatusChanged(ScanStatus::Error {
                        message: e.to_string(),
                    }));
                return Err(e.into());
            }
        };

        let id = {
            let mut next = self.inner.next_session_id.lock().await;
            *next += 1;
            *next
        };

        let scanner = self.clone();
        let task = tokio::spawn(async move {
            scanner.run_session(id, events).await;
        });
        *session = Some(ScanSession { id, task });

        info!(
            "Scan session {} started for {}s",
            id,
            self.inner.scan_duration.as_secs()
        );
        self.inner
            .emitter
            .emit_status(TelemetryEvent::ScanStatusChanged(ScanStatus::Scanning));
        Ok(())
    }

    /// Stop the active scan session, if any
    pub async fn stop_scan(&self) {
        let session = self.inner.session.lock().await.take();
        match session {
            Some(session) => {
                session.task.abort();
                self.finish(session.id).await;
            }
            None => debug!("Stop requested with no active scan session"),
        }
    }

    pub async fn is_scanning(&self) -> bool {
        self.inner.session.lock().await.is_some()
    }

    /// Look up a peripheral in the live table
    pub async fn lookup(&self, address: &str) -> Option<Peripheral> {
        self.inner.peripherals.read().await.get(address).cloned()
    }

    pub async fn peripherals(&self) -> Vec<Peripheral> {
        self.inner.peripherals.read().await.values().cloned().collect()
    }

    async fn run_session(&self, id: u64, mut events: futures_util::stream::BoxStream<'static, ScanEvent>) {
        let deadline = sleep(self.inner.scan_duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    debug!("Scan session {} reached its duration", id);
                    break;
                }
                event = events.next() => match event {
                    Some(ScanEvent::Advertisement(advertisement)) => {
                        self.record(advertisement).await;
                    }
                    Some(ScanEvent::PoweredChanged(true)) => {}
                    Some(ScanEvent::PoweredChanged(false)) => {
                        warn!("Radio powered off during scan session {}", id);
                        break;
                    }
                    None => {
                        debug!("Discovery stream of session {} ended", id);
                        break;
                    }
                },
            }
        }

        // Only end the session if stop_scan has not already taken it
        let mut session = self.inner.session.lock().await;
        if session.as_ref().map(|s| s.id) == Some(id) {
            session.take();
            drop(session);
            self.finish(id).await;
        }
    }

    async fn finish(&self, id: u64) {
        if let Err(e) = self.inner.radio.scan_stop().await {
            warn!("Failed to stop scanning: {}", e);
        }

        let device_count = self.inner.peripherals.read().await.len();
        info!(
            "Scan session {} stopped with {} device(s) in range",
            id, device_count
        );
        self.inner
            .emitter
            .emit_status(TelemetryEvent::ScanStatusChanged(ScanStatus::Idle {
                device_count,
            }));
    }

    /// Apply one advertisement to the live table
    async fn record(&self, advertisement: Advertisement) {
        let address = format_mac(&advertisement.handle.mac());
        let mut peripherals = self.inner.peripherals.write().await;

        let event = match peripherals.get_mut(&address) {
            None => {
                let peripheral = Peripheral {
                    address: address.clone(),
                    display_name: advertisement.name,
                    signal_strength: advertisement.rssi,
                    last_seen_at: OffsetDateTime::now_utc(),
                    connection_handle: Some(advertisement.handle),
                };
                debug!(
                    "Discovered {} ({}) at {} dBm",
                    address,
                    peripheral.display_name.as_deref().unwrap_or("unnamed"),
                    peripheral.signal_strength
                );
                peripherals.insert(address, peripheral.clone());
                DiscoveryEvent::PeripheralDiscovered(peripheral)
            }
            Some(existing) => {
                let rssi_changed = existing.signal_strength != advertisement.rssi;
                let name_learned = existing.display_name.is_none() && advertisement.name.is_some();
                if !rssi_changed && !name_learned {
                    return;
                }

                existing.signal_strength = advertisement.rssi;
                if name_learned {
                    existing.display_name = advertisement.name;
                }
                existing.last_seen_at = OffsetDateTime::now_utc();
                existing.connection_handle = Some(advertisement.handle);
                DiscoveryEvent::PeripheralUpdated(existing.clone())
            }
        };
        drop(peripherals);

        // No listeners is fine
        let _ = self.inner.discovery_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{advertisement, wait_for_event, FakeRadio, RecordingSink};

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn scanner_with(radio: &Arc<FakeRadio>, duration: Duration) -> (Scanner, TelemetryEmitter) {
        let emitter = TelemetryEmitter::spawn(Arc::new(RecordingSink::default()));
        let scanner = Scanner::new(radio.clone(), emitter.clone(), duration);
        (scanner, emitter)
    }

    #[tokio::test]
    async fn start_scan_requires_a_powered_radio() {
        let radio = FakeRadio::new();
        radio.set_powered(false);
        let (scanner, _) = scanner_with(&radio, Duration::from_secs(30));

        assert!(matches!(scanner.start_scan().await, Err(ScanError::RadioNotReady)));
        assert!(!scanner.is_scanning().await);
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_scanning() {
        let radio = FakeRadio::new();
        let (scanner, _) = scanner_with(&radio, Duration::from_secs(30));

        scanner.start_scan().await.unwrap();
        assert!(matches!(scanner.start_scan().await, Err(ScanError::AlreadyScanning)));
        scanner.stop_scan().await;
        assert!(!scanner.is_scanning().await);
    }

    #[tokio::test]
    async fn advertisements_populate_the_live_table() {
        let radio = FakeRadio::new();
        let (scanner, _) = scanner_with(&radio, Duration::from_secs(30));
        let mut discovery = scanner.subscribe();

        scanner.start_scan().await.unwrap();
        radio.advertise(advertisement(ADDRESS, Some("Cuff"), -60));

        let event = discovery.recv().await.unwrap();
        assert!(matches!(event, DiscoveryEvent::PeripheralDiscovered(ref p) if p.address == ADDRESS));

        let peripheral = scanner.lookup(ADDRESS).await.unwrap();
        assert_eq!(peripheral.display_name.as_deref(), Some("Cuff"));
        assert_eq!(peripheral.signal_strength, -60);
        assert!(peripheral.connection_handle.is_some());
    }

    #[tokio::test]
    async fn updates_only_on_rssi_change_or_new_name() {
        let radio = FakeRadio::new();
        let (scanner, _) = scanner_with(&radio, Duration::from_secs(30));
        let mut discovery = scanner.subscribe();
        scanner.start_scan().await.unwrap();

        radio.advertise(advertisement(ADDRESS, None, -70));
        radio.advertise(advertisement(ADDRESS, None, -70));
        radio.advertise(advertisement(ADDRESS, Some("Scale"), -70));
        radio.advertise(advertisement(ADDRESS, Some("Scale"), -70));
        radio.advertise(advertisement(ADDRESS, Some("Scale"), -65));

        assert!(matches!(discovery.recv().await.unwrap(), DiscoveryEvent::PeripheralDiscovered(_)));
        match discovery.recv().await.unwrap() {
            DiscoveryEvent::PeripheralUpdated(p) => {
                assert_eq!(p.display_name.as_deref(), Some("Scale"));
                assert_eq!(p.signal_strength, -70);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match discovery.recv().await.unwrap() {
            DiscoveryEvent::PeripheralUpdated(p) => assert_eq!(p.signal_strength, -65),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(discovery.try_recv().is_err());
    }

    #[tokio::test]
    async fn session_stops_after_its_duration() {
        let radio = FakeRadio::new();
        let (scanner, emitter) = scanner_with(&radio, Duration::from_millis(50));
        let mut events = emitter.subscribe();

        scanner.start_scan().await.unwrap();
        radio.advertise(advertisement(ADDRESS, None, -50));

        let idle = wait_for_event(&mut events, |event| {
            matches!(event, TelemetryEvent::ScanStatusChanged(ScanStatus::Idle { .. }))
        })
        .await;
        assert_eq!(
            idle,
            TelemetryEvent::ScanStatusChanged(ScanStatus::Idle { device_count: 1 })
        );
        assert!(!scanner.is_scanning().await);
        assert_eq!(radio.scan_stops(), 1);
        // Entries outlive the session until the next one starts
        assert!(scanner.lookup(ADDRESS).await.is_some());
    }

    #[tokio::test]
    async fn new_session_clears_the_table() {
        let radio = FakeRadio::new();
        let (scanner, _) = scanner_with(&radio, Duration::from_secs(30));
        let mut discovery = scanner.subscribe();

        scanner.start_scan().await.unwrap();
        radio.advertise(advertisement(ADDRESS, None, -50));
        discovery.recv().await.unwrap();
        scanner.stop_scan().await;

        scanner.start_scan().await.unwrap();
        assert!(scanner.lookup(ADDRESS).await.is_none());
    }

    #[tokio::test]
    async fn power_loss_ends_the_session() {
        let radio = FakeRadio::new();
        let (scanner, emitter) = scanner_with(&radio, Duration::from_secs(30));
        let mut events = emitter.subscribe();

        scanner.start_scan().await.unwrap();
        radio.power_off_during_scan();

        wait_for_event(&mut events, |event| {
            matches!(event, TelemetryEvent::ScanStatusChanged(ScanStatus::Idle { .. }))
        })
        .await;
        assert!(!scanner.is_scanning().await);
    }

    #[tokio::test]
    async fn stop_tolerates_radio_failure_and_is_idempotent() {
        let radio = FakeRadio::new();
        radio.fail_scan_stop();
        let (scanner, emitter) = scanner_with(&radio, Duration::from_secs(30));
        let mut events = emitter.subscribe();

        scanner.start_scan().await.unwrap();
        scanner.stop_scan().await;
        scanner.stop_scan().await;

        let idle = wait_for_event(&mut events, |event| {
            matches!(event, TelemetryEvent::ScanStatusChanged(ScanStatus::Idle { .. }))
        })
        .await;
        assert_eq!(
            idle,
            TelemetryEvent::ScanStatusChanged(ScanStatus::Idle { device_count: 0 })
        );
        assert_eq!(radio.scan_stops(), 1);
    }

    #[tokio::test]
    async fn failed_radio_start_surfaces_a_scan_error() {
        let radio = FakeRadio::new();
        radio.fail_scan_start();
        let (scanner, emitter) = scanner_with(&radio, Duration::from_secs(30));
        let mut events = emitter.subscribe();

        assert!(matches!(scanner.start_scan().await, Err(ScanError::Radio(_))));
        let event = wait_for_event(&mut events, |event| {
            matches!(event, TelemetryEvent::ScanStatusChanged(_))
        })
        .await;
        assert!(matches!(
            event,
            TelemetryEvent::ScanStatusChanged(ScanStatus::Error { .. })
        ));
    }
}
