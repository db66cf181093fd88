/// PostgreSQL-backed device registry and telemetry sink
use async_trait::async_trait;
use time::OffsetDateTime;
use tokio_postgres::Row;

use crate::database::connection::execute_with_retry;
use crate::error::{DatabaseError, RegistryError, SinkError};
use crate::models::{DecodedReading, Measurement, PairedDevice, StoredRecord, VitalKind};
use crate::registry::DeviceRegistry;
use crate::telemetry::TelemetrySink;

// A poll tick should not hang on the database for long; readings are worth waiting for
const REGISTRY_RETRIES: usize = 3;
const SINK_RETRIES: usize = 12;

/// Reads `paired_devices`; pairing and trust flags are managed elsewhere
#[derive(Debug, Clone)]
pub struct PostgresRegistry {
    database_url: String,
}

impl PostgresRegistry {
    pub fn new(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
        }
    }
}

#[async_trait]
impl DeviceRegistry for PostgresRegistry {
    async fn list_paired(&self, kind: VitalKind) -> Result<Vec<PairedDevice>, RegistryError> {
        let rows = execute_with_retry(&self.database_url, REGISTRY_RETRIES, move |client| async move {
            client
                .query(
                    "SELECT address, display_name, vital_kind, is_paired, is_trusted
                     FROM paired_devices
                     WHERE vital_kind = $1 AND is_paired",
                    &[&kind.as_str()],
                )
                .await
        })
        .await?;

        Ok(rows.iter().map(device_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn set_last_seen(&self, address: &str, seen_at: OffsetDateTime) -> Result<(), RegistryError> {
        let address = address.to_string();
        let updated = execute_with_retry(&self.database_url, REGISTRY_RETRIES, |client| {
            let address = address.clone();
            async move {
                client
                    .execute(
                        "UPDATE paired_devices SET last_seen_at = $1 WHERE address = $2",
                        &[&seen_at, &address],
                    )
                    .await
            }
        })
        .await?;

        if updated == 0 {
            return Err(RegistryError::UnknownDevice(address));
        }
        Ok(())
    }
}

fn device_from_row(row: &Row) -> Result<PairedDevice, DatabaseError> {
    let invalid = |e: tokio_postgres::Error| DatabaseError::InvalidRow(e.to_string());

    let kind: String = row.try_get("vital_kind").map_err(invalid)?;
    Ok(PairedDevice {
        address: row.try_get("address").map_err(invalid)?,
        display_name: row.try_get("display_name").map_err(invalid)?,
        vital_kind: kind
            .parse()
            .map_err(|e: crate::error::UnknownVitalKind| DatabaseError::InvalidRow(e.to_string()))?,
        is_paired: row.try_get("is_paired").map_err(invalid)?,
        is_trusted: row.try_get("is_trusted").map_err(invalid)?,
    })
}

/// Column values of one `vital_readings` row
#[derive(Debug, Clone, PartialEq)]
struct ReadingColumns {
    value: f64,
    secondary_value: Option<f64>,
    mean_arterial_pressure: Option<i32>,
    pulse: Option<f64>,
    unit: &'static str,
}

impl From<&Measurement> for ReadingColumns {
    fn from(measurement: &Measurement) -> Self {
        let columns = |value, unit| ReadingColumns {
            value,
            secondary_value: None,
            mean_arterial_pressure: None,
            pulse: None,
            unit,
        };

        match measurement {
            Measurement::HeartRate { bpm } => columns(f64::from(*bpm), "bpm"),
            Measurement::BloodPressure {
                systolic_mmhg,
                diastolic_mmhg,
                mean_arterial_pressure_mmhg,
                pulse_bpm,
            } => ReadingColumns {
                secondary_value: Some(f64::from(*diastolic_mmhg)),
                mean_arterial_pressure: *mean_arterial_pressure_mmhg,
                pulse: pulse_bpm.map(f64::from),
                ..columns(f64::from(*systolic_mmhg), "mmHg")
            },
            Measurement::Weight { value, unit } => columns(*value, unit.as_str()),
            Measurement::Temperature { value_fahrenheit } => columns(*value_fahrenheit, "°F"),
            Measurement::SpO2 { percent, pulse_bpm } => ReadingColumns {
                pulse: *pulse_bpm,
                ..columns(*percent, "%")
            },
            Measurement::Glucose { mg_per_dl } => columns(*mg_per_dl, "mg/dL"),
        }
    }
}

/// Appends accepted readings to `vital_readings`
#[derive(Debug, Clone)]
pub struct PostgresSink {
    database_url: String,
}

impl PostgresSink {
    pub fn new(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
        }
    }
}

#[async_trait]
impl TelemetrySink for PostgresSink {
    async fn store(&self, reading: &DecodedReading) -> Result<StoredRecord, SinkError> {
        let columns = ReadingColumns::from(&reading.measurement);
        let address = reading.device_address.clone();
        let kind = reading.kind().as_str();
        let observed_at = reading.observed_at;

        let row = execute_with_retry(&self.database_url, SINK_RETRIES, |client| {
            let columns = columns.clone();
            let address = address.clone();
            async move {
                client
                    .query_one(
                        "INSERT INTO vital_readings(device_address, vital_kind, observed_at, value,
                             secondary_value, mean_arterial_pressure, pulse, unit)
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                         RETURNING id",
                        &[
                            &address,
                            &kind,
                            &observed_at,
                            &columns.value,
                            &columns.secondary_value,
                            &columns.mean_arterial_pressure,
                            &columns.pulse,
                            &columns.unit,
                        ],
                    )
                    .await
            }
        })
        .await?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| DatabaseError::InvalidRow(e.to_string()))?;
        Ok(StoredRecord {
            id,
            reading: reading.clone(),
        })
    }
}
