//! In-process fakes for the radio and the telemetry sink, used by unit tests
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use crate::bluetooth::radio::{
    Advertisement, CharacteristicHandle, Link, Radio, ScanEvent, ServiceHandle,
};
use crate::error::{DatabaseError, RadioError, SinkError};
use crate::models::{DecodedReading, PairedDevice, PeripheralHandle, StoredRecord, VitalKind};
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::utils::{format_mac, parse_mac};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

pub fn advertisement(address: &str, name: Option<&str>, rssi: i16) -> Advertisement {
    Advertisement {
        handle: PeripheralHandle::new(parse_mac(address).expect("test address")),
        name: name.map(str::to_string),
        rssi,
    }
}

pub fn paired(address: &str, kind: VitalKind) -> PairedDevice {
    PairedDevice {
        address: address.to_string(),
        display_name: format!("Test {}", kind),
        vital_kind: kind,
        is_paired: true,
        is_trusted: true,
    }
}

/// Wait for the first broadcast item matching the predicate
pub async fn wait_for_event<T: Clone + Debug>(
    rx: &mut broadcast::Receiver<T>,
    predicate: impl Fn(&T) -> bool,
) -> T {
    timeout(WAIT_LIMIT, async {
        loop {
            match rx.recv().await {
                Ok(item) if predicate(&item) => return item,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("channel closed while waiting"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Succeed,
    Hang,
    Reject,
    MissingService,
    MissingCharacteristic,
    FailSubscribe,
}

#[derive(Default)]
struct LinkControl {
    notifications: Option<mpsc::UnboundedSender<Vec<u8>>>,
    dropped: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct FakeState {
    scan_tx: Option<mpsc::UnboundedSender<ScanEvent>>,
    scan_stops: usize,
    fail_scan_start: bool,
    fail_scan_stop: bool,
    behaviors: HashMap<[u8; 6], ConnectBehavior>,
    links: HashMap<[u8; 6], LinkControl>,
    calls: Vec<String>,
}

/// Scriptable radio: tests push advertisements and notifications into it
pub struct FakeRadio {
    powered: AtomicBool,
    state: Arc<StdMutex<FakeState>>,
}

impl FakeRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            powered: AtomicBool::new(true),
            state: Arc::new(StdMutex::new(FakeState::default())),
        })
    }

    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
    }

    pub fn power_off_during_scan(&self) {
        self.set_powered(false);
        if let Some(tx) = &self.state.lock().unwrap().scan_tx {
            let _ = tx.send(ScanEvent::PoweredChanged(false));
        }
    }

    pub fn advertise(&self, advertisement: Advertisement) {
        if let Some(tx) = &self.state.lock().unwrap().scan_tx {
            let _ = tx.send(ScanEvent::Advertisement(advertisement));
        }
    }

    pub fn fail_scan_start(&self) {
        self.state.lock().unwrap().fail_scan_start = true;
    }

    pub fn fail_scan_stop(&self) {
        self.state.lock().unwrap().fail_scan_stop = true;
    }

    pub fn scan_stops(&self) -> usize {
        self.state.lock().unwrap().scan_stops
    }

    pub fn set_behavior(&self, address: &str, behavior: ConnectBehavior) {
        let mac = parse_mac(address).expect("test address");
        self.state.lock().unwrap().behaviors.insert(mac, behavior);
    }

    /// Deliver a notification on the device's subscribed characteristic
    pub fn notify(&self, address: &str, payload: &[u8]) -> bool {
        let mac = parse_mac(address).expect("test address");
        let state = self.state.lock().unwrap();
        match state.links.get(&mac).and_then(|link| link.notifications.as_ref()) {
            Some(tx) => tx.send(payload.to_vec()).is_ok(),
            None => false,
        }
    }

    /// Simulate the peripheral dropping the link
    pub fn drop_link(&self, address: &str) -> bool {
        let mac = parse_mac(address).expect("test address");
        self.state.lock().unwrap().links.remove(&mac).is_some()
    }

    /// End the notification stream while the link itself stays up
    pub fn end_notifications(&self, address: &str) -> bool {
        let mac = parse_mac(address).expect("test address");
        let mut state = self.state.lock().unwrap();
        match state.links.get_mut(&mac) {
            Some(link) => link.notifications.take().is_some(),
            None => false,
        }
    }

    pub fn link_open(&self, address: &str) -> bool {
        let mac = parse_mac(address).expect("test address");
        self.state.lock().unwrap().links.contains_key(&mac)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|call| call.starts_with(prefix)).count()
    }
}

fn channel_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

#[async_trait]
impl Radio for FakeRadio {
    async fn is_powered(&self) -> Result<bool, RadioError> {
        Ok(self.powered.load(Ordering::SeqCst))
    }

    async fn scan_start(&self) -> Result<BoxStream<'static, ScanEvent>, RadioError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_scan_start {
            return Err(RadioError::Operation("scan start refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.scan_tx = Some(tx);
        Ok(channel_stream(rx))
    }

    async fn scan_stop(&self) -> Result<(), RadioError> {
        let mut state = self.state.lock().unwrap();
        state.scan_stops += 1;
        state.scan_tx = None;
        if state.fail_scan_stop {
            return Err(RadioError::Operation("scan stop refused".to_string()));
        }
        Ok(())
    }

    async fn connect(&self, handle: &PeripheralHandle) -> Result<Box<dyn Link>, RadioError> {
        let mac = handle.mac();
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("connect {}", format_mac(&mac)));
            state
                .behaviors
                .get(&mac)
                .copied()
                .unwrap_or(ConnectBehavior::Succeed)
        };

        match behavior {
            ConnectBehavior::Hang => std::future::pending().await,
            ConnectBehavior::Reject => Err(RadioError::Operation("link rejected".to_string())),
            _ => Ok(Box::new(FakeLink {
                mac,
                behavior,
                state: self.state.clone(),
            })),
        }
    }
}

struct FakeLink {
    mac: [u8; 6],
    behavior: ConnectBehavior,
    state: Arc<StdMutex<FakeState>>,
}

impl FakeLink {
    fn record(&self, call: &str) {
        self.state.lock().unwrap().calls.push(call.to_string());
    }
}

#[async_trait]
impl Link for FakeLink {
    async fn discover_services(&self, filter: &[Uuid]) -> Result<Vec<ServiceHandle>, RadioError> {
        self.record("discover_services");
        if self.behavior == ConnectBehavior::MissingService {
            return Ok(Vec::new());
        }
        Ok(filter.iter().map(|uuid| ServiceHandle { id: 1, uuid: *uuid }).collect())
    }

    async fn discover_characteristics(
        &self,
        service: &ServiceHandle,
        filter: &[Uuid],
    ) -> Result<Vec<CharacteristicHandle>, RadioError> {
        self.record("discover_characteristics");
        if self.behavior == ConnectBehavior::MissingCharacteristic {
            return Ok(Vec::new());
        }
        Ok(filter
            .iter()
            .map(|uuid| CharacteristicHandle {
                service_id: service.id,
                id: 2,
                uuid: *uuid,
            })
            .collect())
    }

    async fn subscribe(
        &self,
        _characteristic: &CharacteristicHandle,
    ) -> Result<BoxStream<'static, Vec<u8>>, RadioError> {
        self.record("subscribe");
        if self.behavior == ConnectBehavior::FailSubscribe {
            return Err(RadioError::Operation("notify refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .unwrap()
            .links
            .entry(self.mac)
            .or_default()
            .notifications = Some(tx);
        Ok(channel_stream(rx))
    }

    async fn on_disconnect(&self) -> Result<BoxFuture<'static, ()>, RadioError> {
        let (tx, rx) = oneshot::channel::<()>();
        self.state
            .lock()
            .unwrap()
            .links
            .entry(self.mac)
            .or_default()
            .dropped = Some(tx);
        // Resolves when the control entry is removed, like a radio link drop
        Ok(Box::pin(async move {
            let _ = rx.await;
        }))
    }

    async fn disconnect(&self) -> Result<(), RadioError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("disconnect".to_string());
        state.links.remove(&self.mac);
        Ok(())
    }
}

/// Sink that keeps everything it is given
#[derive(Default)]
pub struct RecordingSink {
    readings: Mutex<Vec<DecodedReading>>,
    published: Mutex<Vec<TelemetryEvent>>,
    fail_next: AtomicBool,
    next_id: AtomicI64,
}

impl RecordingSink {
    pub fn fail_next_store(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub async fn readings(&self) -> Vec<DecodedReading> {
        self.readings.lock().await.clone()
    }

    pub async fn published(&self) -> Vec<TelemetryEvent> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    async fn store(&self, reading: &DecodedReading) -> Result<StoredRecord, SinkError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SinkError::Database(DatabaseError::RetriesExhausted {
                attempts: 1,
                last_error: "scripted failure".to_string(),
            }));
        }
        self.readings.lock().await.push(reading.clone());
        Ok(StoredRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            reading: reading.clone(),
        })
    }

    async fn publish(&self, event: &TelemetryEvent) -> Result<(), SinkError> {
        self.published.lock().await.push(event.clone());
        Ok(())
    }
}
