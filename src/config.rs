use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;

use log::{debug, info, warn};
use tokio::time::Duration;

use crate::bluetooth::connection::ConnectionConfig;
use crate::error::ConfigError;
use crate::models::{PairedDevice, VitalKind};
use crate::utils::{normalize_address, parse_mac};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub paired_devices: Vec<PairedDevice>,
    pub scan_duration: Duration,
    pub scan_interval: Duration,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub max_connect_attempts: u32,
    pub debounce_window: Duration,
    pub debounce_sweep: Duration,
    pub kinds: Vec<VitalKind>,
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();
        Self::from_vars(env::vars())
    }

    /// Build the configuration from a set of variables
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self, ConfigError> {
        let vars: BTreeMap<String, String> = vars.into_iter().collect();

        let database_url = vars
            .get("DATABASE_URL")
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        let paired_devices = match vars.get("PAIRED_DEVICES") {
            Some(entries) => {
                debug!("Found PAIRED_DEVICES: '{}'", entries);
                parse_device_list(entries)?
            }
            None => {
                debug!("PAIRED_DEVICES not set, trying PAIRED_DEVICE_<N>_* variables");
                parse_indexed_devices(&vars)?
            }
        };

        info!("Total paired devices configured: {}", paired_devices.len());
        for device in &paired_devices {
            info!(
                "Device: {} -> {} ({})",
                device.address, device.display_name, device.vital_kind
            );
        }
        if database_url.is_none() && paired_devices.is_empty() {
            warn!("No DATABASE_URL and no paired devices configured; nothing will connect");
        }

        let kinds = match vars.get("VITAL_KINDS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|kind| !kind.is_empty())
                .map(VitalKind::from_str)
                .collect::<Result<Vec<_>, _>>()?,
            None => VitalKind::ALL.to_vec(),
        };

        Ok(AppConfig {
            database_url,
            paired_devices,
            scan_duration: Duration::from_secs(number(&vars, "SCAN_DURATION_SECS", 30)?),
            scan_interval: Duration::from_secs(number(&vars, "SCAN_INTERVAL_SECS", 60)?),
            poll_interval: Duration::from_secs(number(&vars, "POLL_INTERVAL_SECS", 15)?),
            connect_timeout: Duration::from_secs(number(&vars, "CONNECT_TIMEOUT_SECS", 10)?),
            max_connect_attempts: number(&vars, "MAX_CONNECT_ATTEMPTS", 20)?,
            debounce_window: Duration::from_millis(number(&vars, "DEBOUNCE_WINDOW_MS", 5000)?),
            debounce_sweep: Duration::from_secs(number(&vars, "DEBOUNCE_SWEEP_SECS", 30)?),
            kinds,
        })
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            poll_interval: self.poll_interval,
            connect_timeout: self.connect_timeout,
            max_attempts: self.max_connect_attempts,
            kinds: self.kinds.clone(),
        }
    }
}

/// Positive integer variable with a default
fn number<T>(vars: &BTreeMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let Some(raw) = vars.get(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(ConfigError::InvalidNumber {
            name: name.to_string(),
            value: raw.clone(),
        }),
    }
}

/// `MAC=kind[=Display Name]`, comma separated
fn parse_device_list(entries: &str) -> Result<Vec<PairedDevice>, ConfigError> {
    let mut devices = Vec::new();
    for entry in entries.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let mut parts = entry.splitn(3, '=').map(str::trim);
        let (Some(mac), Some(kind)) = (parts.next(), parts.next()) else {
            return Err(ConfigError::InvalidEntry(entry.to_string()));
        };
        let name = parts.next().filter(|name| !name.is_empty());
        devices.push(device(mac, kind, name)?);
    }
    Ok(devices)
}

fn parse_indexed_devices(vars: &BTreeMap<String, String>) -> Result<Vec<PairedDevice>, ConfigError> {
    let mut devices = Vec::new();
    for (key, mac) in vars {
        let Some(index) = key
            .strip_prefix("PAIRED_DEVICE_")
            .and_then(|rest| rest.strip_suffix("_MAC"))
        else {
            continue;
        };

        let kind = vars
            .get(&format!("PAIRED_DEVICE_{}_KIND", index))
            .ok_or_else(|| ConfigError::InvalidEntry(format!("{} has no PAIRED_DEVICE_{}_KIND", key, index)))?;
        let name = vars
            .get(&format!("PAIRED_DEVICE_{}_NAME", index))
            .map(String::as_str);
        devices.push(device(mac, kind, name)?);
    }
    Ok(devices)
}

fn device(mac: &str, kind: &str, name: Option<&str>) -> Result<PairedDevice, ConfigError> {
    let address = normalize_address(mac);
    if parse_mac(&address).is_none() {
        return Err(ConfigError::InvalidAddress(mac.to_string()));
    }
    let vital_kind = VitalKind::from_str(kind)?;

    Ok(PairedDevice {
        display_name: name.map_or_else(|| format!("{} {}", vital_kind, address), str::to_string),
        address,
        vital_kind,
        is_paired: true,
        is_trusted: true,
    })
}
