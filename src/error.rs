/// Error types shared across the pipeline
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("unknown vital kind '{0}'")]
pub struct UnknownVitalKind(pub String);

/// Failures reported by the radio stack primitives
#[derive(Debug, Error)]
pub enum RadioError {
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),
    #[error("radio operation failed: {0}")]
    Operation(String),
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("radio is not powered on")]
    RadioNotReady,
    #[error("a scan session is already active")]
    AlreadyScanning,
    #[error(transparent)]
    Radio(#[from] RadioError),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("link rejected: {0}")]
    LinkRejected(#[source] RadioError),
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("GATT discovery failed: {0}")]
    DiscoveryFailed(#[source] RadioError),
    #[error("subscribe failed: {0}")]
    SubscribeFailed(#[source] RadioError),
    #[error("device {0} is not paired")]
    NotPaired(String),
    #[error("device {0} is not in range")]
    OutOfRange(String),
    #[error("device {0} is already connected")]
    AlreadyConnected(String),
    #[error("a connection attempt to {0} is already in progress")]
    AttemptInProgress(String),
    #[error("connection manager is stopped")]
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload too short: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("no decoder for service {service} characteristic {characteristic}")]
    UnknownCharacteristic { service: Uuid, characteristic: Uuid },
    #[error("reserved IEEE-11073 value {0:#06x}")]
    ReservedValue(u32),
    #[error("record carries no measurement value")]
    NoMeasurement,
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("sslrootcert parameter missing")]
    MissingRootCert,
    #[error("SSL error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),
    #[error("invalid row: {0}")]
    InvalidRow(String),
    #[error("max retries exceeded after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: usize, last_error: String },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("device {0} is not registered")]
    UnknownDevice(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be a positive integer, got '{value}'")]
    InvalidNumber { name: String, value: String },
    #[error(transparent)]
    UnknownKind(#[from] UnknownVitalKind),
    #[error("invalid device address '{0}'")]
    InvalidAddress(String),
    #[error("invalid paired device entry '{0}', expected MAC=kind[=name]")]
    InvalidEntry(String),
}
