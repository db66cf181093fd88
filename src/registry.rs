/// Device registry: which peripherals the user has paired with the hub
use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::error::RegistryError;
use crate::models::{PairedDevice, VitalKind};

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Paired devices of one kind
    async fn list_paired(&self, kind: VitalKind) -> Result<Vec<PairedDevice>, RegistryError>;

    async fn set_last_seen(&self, address: &str, seen_at: OffsetDateTime) -> Result<(), RegistryError>;
}

/// Registry held in memory, seeded from configuration
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    devices: RwLock<Vec<PairedDevice>>,
    last_seen: RwLock<HashMap<String, OffsetDateTime>>,
}

impl MemoryRegistry {
    pub fn new(devices: Vec<PairedDevice>) -> Self {
        Self {
            devices: RwLock::new(devices),
            last_seen: RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace a device by address
    #[cfg(test)]
    pub async fn pair(&self, device: PairedDevice) {
        let mut devices = self.devices.write().await;
        devices.retain(|existing| existing.address != device.address);
        devices.push(device);
    }

    #[cfg(test)]
    pub async fn unpair(&self, address: &str) {
        self.devices
            .write()
            .await
            .retain(|device| device.address != address);
    }

    #[cfg(test)]
    pub async fn last_seen(&self, address: &str) -> Option<OffsetDateTime> {
        self.last_seen.read().await.get(address).copied()
    }
}

#[async_trait]
impl DeviceRegistry for MemoryRegistry {
    async fn list_paired(&self, kind: VitalKind) -> Result<Vec<PairedDevice>, RegistryError> {
        Ok(self
            .devices
            .read()
            .await
            .iter()
            .filter(|device| device.vital_kind == kind && device.is_paired)
            .cloned()
            .collect())
    }

    async fn set_last_seen(&self, address: &str, seen_at: OffsetDateTime) -> Result<(), RegistryError> {
        let known = self
            .devices
            .read()
            .await
            .iter()
            .any(|device| device.address == address);
        if !known {
            return Err(RegistryError::UnknownDevice(address.to_string()));
        }

        self.last_seen
            .write()
            .await
            .insert(address.to_string(), seen_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(address: &str, kind: VitalKind, is_paired: bool) -> PairedDevice {
        PairedDevice {
            address: address.to_string(),
            display_name: "Test".to_string(),
            vital_kind: kind,
            is_paired,
            is_trusted: true,
        }
    }

    #[tokio::test]
    async fn lists_only_paired_devices_of_the_kind() {
        let registry = MemoryRegistry::new(vec![
            device("AA:AA:AA:AA:AA:01", VitalKind::BloodPressure, true),
            device("AA:AA:AA:AA:AA:02", VitalKind::BloodPressure, false),
            device("AA:AA:AA:AA:AA:03", VitalKind::Weight, true),
        ]);

        let paired = registry.list_paired(VitalKind::BloodPressure).await.unwrap();
        assert_eq!(paired.len(), 1);
        assert_eq!(paired[0].address, "AA:AA:AA:AA:AA:01");
    }

    #[tokio::test]
    async fn last_seen_requires_a_known_device() {
        let registry = MemoryRegistry::new(vec![device("AA:AA:AA:AA:AA:01", VitalKind::HeartRate, true)]);
        let now = OffsetDateTime::now_utc();

        registry.set_last_seen("AA:AA:AA:AA:AA:01", now).await.unwrap();
        assert_eq!(registry.last_seen("AA:AA:AA:AA:AA:01").await, Some(now));
        assert!(matches!(
            registry.set_last_seen("AA:AA:AA:AA:AA:09", now).await,
            Err(RegistryError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn unpair_removes_the_device() {
        let registry = MemoryRegistry::new(vec![device("AA:AA:AA:AA:AA:01", VitalKind::HeartRate, true)]);
        registry.unpair("AA:AA:AA:AA:AA:01").await;
        assert!(registry.list_paired(VitalKind::HeartRate).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pair_replaces_an_existing_entry() {
        let registry = MemoryRegistry::new(vec![device("AA:AA:AA:AA:AA:01", VitalKind::HeartRate, false)]);
        registry
            .pair(device("AA:AA:AA:AA:AA:01", VitalKind::HeartRate, true))
            .await;

        let paired = registry.list_paired(VitalKind::HeartRate).await.unwrap();
        assert_eq!(paired.len(), 1);
        assert!(paired[0].is_paired);
    }
}
