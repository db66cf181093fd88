/// BlueZ implementation of the radio primitives, built on `bluer`
use async_trait::async_trait;
use bluer::{AdapterEvent, AdapterProperty, DeviceEvent, DeviceProperty};
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use log::{debug, error, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::bluetooth::radio::{
    Advertisement, CharacteristicHandle, Link, Radio, ScanEvent, ServiceHandle,
};
use crate::error::RadioError;
use crate::models::PeripheralHandle;

// BlueZ resolves GATT services asynchronously after the link comes up
const SERVICES_RESOLVED_POLL_MS: u64 = 100;
const SERVICES_RESOLVED_MAX_POLLS: u32 = 50;

pub struct BluerRadio {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    discovery: Mutex<Option<JoinHandle<()>>>,
}

impl BluerRadio {
    /// Open a BlueZ session on the default adapter and make sure it is powered
    pub async fn new() -> Result<Self, RadioError> {
        let session = match bluer::Session::new().await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to create Bluetooth session: {}", e);
                return Err(e.into());
            }
        };

        let adapter = match session.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                error!("Failed to get default Bluetooth adapter: {}", e);
                return Err(e.into());
            }
        };

        // A powered-off adapter is reported through is_powered, not treated as fatal
        if let Err(e) = adapter.set_powered(true).await {
            warn!("Failed to power on adapter {}: {}", adapter.name(), e);
        }

        Ok(Self {
            _session: session,
            adapter,
            discovery: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Radio for BluerRadio {
    async fn is_powered(&self) -> Result<bool, RadioError> {
        Ok(self.adapter.is_powered().await?)
    }

    async fn scan_start(&self) -> Result<BoxStream<'static, ScanEvent>, RadioError> {
        // Configure discovery filter for Low Energy devices only
        let filter = bluer::DiscoveryFilter {
            transport: bluer::DiscoveryTransport::Le,
            duplicate_data: false,
            ..Default::default()
        };

        if let Err(e) = self.adapter.set_discovery_filter(filter).await {
            warn!("Failed to set discovery filter: {}", e);
        }

        let discovery_stream = self.adapter.discover_devices().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();

        let task = tokio::spawn(async move {
            let mut events = Box::pin(discovery_stream);
            // Dropping the set (task end or abort) stops every property watcher
            let mut watchers = JoinSet::new();

            while let Some(event) = events.next().await {
                match event {
                    AdapterEvent::DeviceAdded(addr) => {
                        let Ok(device) = adapter.device(addr) else {
                            continue;
                        };

                        let name = device.name().await.ok().flatten();
                        // Cached devices without a current RSSI were not heard in this scan
                        if let Some(rssi) = device.rssi().await.ok().flatten() {
                            let advertisement = Advertisement {
                                handle: PeripheralHandle::new(addr.0),
                                name: name.clone(),
                                rssi,
                            };
                            if tx.send(ScanEvent::Advertisement(advertisement)).is_err() {
                                break;
                            }
                        }

                        match device.events().await {
                            Ok(device_events) => {
                                watchers.spawn(watch_device(
                                    PeripheralHandle::new(addr.0),
                                    name,
                                    device_events,
                                    tx.clone(),
                                ));
                            }
                            Err(e) => debug!("Failed to watch {}: {}", addr, e),
                        }
                    }
                    AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) => {
                        if tx.send(ScanEvent::PoweredChanged(powered)).is_err() {
                            break;
                        }
                    }
                    other => debug!("Discovery event: {:?}", other),
                }
            }
        });

        if let Some(previous) = self.discovery.lock().await.replace(task) {
            previous.abort();
        }

        Ok(receiver_stream(rx))
    }

    async fn scan_stop(&self) -> Result<(), RadioError> {
        if let Some(task) = self.discovery.lock().await.take() {
            task.abort();
        }
        Ok(())
    }

    async fn connect(&self, handle: &PeripheralHandle) -> Result<Box<dyn Link>, RadioError> {
        let device = self.adapter.device(bluer::Address::new(handle.mac()))?;
        device.connect().await?;

        for _ in 0..SERVICES_RESOLVED_MAX_POLLS {
            if device.is_services_resolved().await? {
                return Ok(Box::new(BluerLink { device }));
            }
            sleep(Duration::from_millis(SERVICES_RESOLVED_POLL_MS)).await;
        }

        if let Err(e) = device.disconnect().await {
            debug!("Failed to drop unresolved link to {}: {}", device.address(), e);
        }
        Err(RadioError::Operation(format!(
            "services of {} were never resolved",
            device.address()
        )))
    }
}

/// Forward RSSI and name changes of one device as fresh advertisements
async fn watch_device(
    handle: PeripheralHandle,
    mut name: Option<String>,
    device_events: impl Stream<Item = DeviceEvent> + Send + 'static,
    tx: mpsc::UnboundedSender<ScanEvent>,
) {
    let mut device_events = Box::pin(device_events);
    let mut rssi = None;

    while let Some(DeviceEvent::PropertyChanged(property)) = device_events.next().await {
        match property {
            DeviceProperty::Rssi(value) => rssi = Some(value),
            DeviceProperty::Name(value) => name = Some(value),
            _ => continue,
        }

        if let Some(rssi) = rssi {
            let advertisement = Advertisement {
                handle,
                name: name.clone(),
                rssi,
            };
            if tx.send(ScanEvent::Advertisement(advertisement)).is_err() {
                break;
            }
        }
    }
}

fn receiver_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

struct BluerLink {
    device: bluer::Device,
}

#[async_trait]
impl Link for BluerLink {
    async fn discover_services(&self, filter: &[Uuid]) -> Result<Vec<ServiceHandle>, RadioError> {
        let mut found = Vec::new();
        for service in self.device.services().await? {
            let uuid = service.uuid().await?;
            if filter.is_empty() || filter.contains(&uuid) {
                found.push(ServiceHandle {
                    id: service.id(),
                    uuid,
                });
            }
        }
        Ok(found)
    }

    async fn discover_characteristics(
        &self,
        service: &ServiceHandle,
        filter: &[Uuid],
    ) -> Result<Vec<CharacteristicHandle>, RadioError> {
        let gatt_service = self.device.service(service.id).await?;
        let mut found = Vec::new();
        for characteristic in gatt_service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            if filter.is_empty() || filter.contains(&uuid) {
                found.push(CharacteristicHandle {
                    service_id: service.id,
                    id: characteristic.id(),
                    uuid,
                });
            }
        }
        Ok(found)
    }

    async fn subscribe(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> Result<BoxStream<'static, Vec<u8>>, RadioError> {
        let gatt_service = self.device.service(characteristic.service_id).await?;
        let gatt_characteristic = gatt_service.characteristic(characteristic.id).await?;
        let notifications = gatt_characteristic.notify().await?;
        Ok(notifications.boxed())
    }

    async fn on_disconnect(&self) -> Result<BoxFuture<'static, ()>, RadioError> {
        let device_events = self.device.events().await?;
        Ok(Box::pin(async move {
            let mut device_events = Box::pin(device_events);
            while let Some(event) = device_events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    break;
                }
            }
        }))
    }

    async fn disconnect(&self) -> Result<(), RadioError> {
        Ok(self.device.disconnect().await?)
    }
}
