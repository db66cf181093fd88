/// Radio stack primitives consumed by the scanner and connection manager
///
/// The traits here are the only place the pipeline touches the Bluetooth
/// stack. `BluerRadio` implements them over BlueZ; tests use an in-process
/// fake.
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use uuid::Uuid;

use crate::error::RadioError;
use crate::models::PeripheralHandle;

/// A single advertisement (or advertised property change) seen while scanning
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub handle: PeripheralHandle,
    pub name: Option<String>,
    pub rssi: i16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Advertisement(Advertisement),
    PoweredChanged(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceHandle {
    pub id: u16,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicHandle {
    pub service_id: u16,
    pub id: u16,
    pub uuid: Uuid,
}

#[async_trait]
pub trait Radio: Send + Sync {
    /// Whether the adapter is powered on and able to scan or connect
    async fn is_powered(&self) -> Result<bool, RadioError>;

    /// Start an active LE scan; the stream ends when scanning stops
    async fn scan_start(&self) -> Result<BoxStream<'static, ScanEvent>, RadioError>;

    async fn scan_stop(&self) -> Result<(), RadioError>;

    /// Open a link to a peripheral. Callers bound this with their own timeout.
    async fn connect(&self, handle: &PeripheralHandle) -> Result<Box<dyn Link>, RadioError>;
}

/// An open link to a peripheral
#[async_trait]
pub trait Link: Send + Sync {
    async fn discover_services(&self, filter: &[Uuid]) -> Result<Vec<ServiceHandle>, RadioError>;

    async fn discover_characteristics(
        &self,
        service: &ServiceHandle,
        filter: &[Uuid],
    ) -> Result<Vec<CharacteristicHandle>, RadioError>;

    /// Enable notifications; yields one payload per notification
    async fn subscribe(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> Result<BoxStream<'static, Vec<u8>>, RadioError>;

    /// Register the disconnect handler: the future resolves once the link drops
    async fn on_disconnect(&self) -> Result<BoxFuture<'static, ()>, RadioError>;

    async fn disconnect(&self) -> Result<(), RadioError>;
}
