use std::fmt;
use std::str::FromStr;

use time::OffsetDateTime;

use crate::error::UnknownVitalKind;

/// Device categories the pipeline knows how to connect to and decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VitalKind {
    HeartRate,
    BloodPressure,
    Weight,
    Temperature,
    SpO2,
    Glucose,
}

impl VitalKind {
    pub const ALL: [VitalKind; 6] = [
        VitalKind::HeartRate,
        VitalKind::BloodPressure,
        VitalKind::Weight,
        VitalKind::Temperature,
        VitalKind::SpO2,
        VitalKind::Glucose,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VitalKind::HeartRate => "heart_rate",
            VitalKind::BloodPressure => "blood_pressure",
            VitalKind::Weight => "weight",
            VitalKind::Temperature => "temperature",
            VitalKind::SpO2 => "spo2",
            VitalKind::Glucose => "glucose",
        }
    }
}

impl fmt::Display for VitalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VitalKind {
    type Err = UnknownVitalKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        VitalKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| UnknownVitalKind(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightUnit {
    Kg,
    Lb,
}

impl WeightUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeightUnit::Kg => "kg",
            WeightUnit::Lb => "lb",
        }
    }
}

/// A decoded measurement, already normalized to the unit named by its variant
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    HeartRate {
        bpm: u16,
    },
    BloodPressure {
        systolic_mmhg: i32,
        diastolic_mmhg: i32,
        mean_arterial_pressure_mmhg: Option<i32>,
        pulse_bpm: Option<i32>,
    },
    Weight {
        value: f64,
        unit: WeightUnit,
    },
    Temperature {
        value_fahrenheit: f64,
    },
    SpO2 {
        percent: f64,
        pulse_bpm: Option<f64>,
    },
    Glucose {
        mg_per_dl: f64,
    },
}

/// The part of a measurement the debounce filter compares
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComparableValue {
    Scalar(f64),
    Pair(i32, i32),
    Weight(f64, WeightUnit),
}

impl Measurement {
    pub fn kind(&self) -> VitalKind {
        match self {
            Measurement::HeartRate { .. } => VitalKind::HeartRate,
            Measurement::BloodPressure { .. } => VitalKind::BloodPressure,
            Measurement::Weight { .. } => VitalKind::Weight,
            Measurement::Temperature { .. } => VitalKind::Temperature,
            Measurement::SpO2 { .. } => VitalKind::SpO2,
            Measurement::Glucose { .. } => VitalKind::Glucose,
        }
    }

    pub fn comparable(&self) -> ComparableValue {
        match self {
            Measurement::HeartRate { bpm } => ComparableValue::Scalar(f64::from(*bpm)),
            Measurement::BloodPressure {
                systolic_mmhg,
                diastolic_mmhg,
                ..
            } => ComparableValue::Pair(*systolic_mmhg, *diastolic_mmhg),
            Measurement::Weight { value, unit } => ComparableValue::Weight(*value, *unit),
            Measurement::Temperature { value_fahrenheit } => {
                ComparableValue::Scalar(*value_fahrenheit)
            }
            Measurement::SpO2 { percent, .. } => ComparableValue::Scalar(*percent),
            Measurement::Glucose { mg_per_dl } => ComparableValue::Scalar(*mg_per_dl),
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Measurement::HeartRate { bpm } => write!(f, "heart rate {} bpm", bpm),
            Measurement::BloodPressure {
                systolic_mmhg,
                diastolic_mmhg,
                mean_arterial_pressure_mmhg,
                pulse_bpm,
            } => {
                write!(f, "blood pressure {}/{} mmHg", systolic_mmhg, diastolic_mmhg)?;
                if let Some(map) = mean_arterial_pressure_mmhg {
                    write!(f, ", MAP {}", map)?;
                }
                if let Some(pulse) = pulse_bpm {
                    write!(f, ", pulse {} bpm", pulse)?;
                }
                Ok(())
            }
            Measurement::Weight { value, unit } => {
                write!(f, "weight {:.1} {}", value, unit.as_str())
            }
            Measurement::Temperature { value_fahrenheit } => {
                write!(f, "temperature {:.1}°F", value_fahrenheit)
            }
            Measurement::SpO2 { percent, pulse_bpm } => {
                write!(f, "SpO2 {:.1}%", percent)?;
                if let Some(pulse) = pulse_bpm {
                    write!(f, ", pulse {:.0} bpm", pulse)?;
                }
                Ok(())
            }
            Measurement::Glucose { mg_per_dl } => write!(f, "glucose {:.1} mg/dL", mg_per_dl),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedReading {
    pub device_address: String,
    pub observed_at: OffsetDateTime,
    pub measurement: Measurement,
}

impl DecodedReading {
    pub fn kind(&self) -> VitalKind {
        self.measurement.kind()
    }
}

/// What the persistence collaborator returns for a stored reading
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: i64,
    pub reading: DecodedReading,
}

/// A device the user has associated with the hub, owned by the device registry
#[derive(Debug, Clone, PartialEq)]
pub struct PairedDevice {
    pub address: String,
    pub display_name: String,
    pub vital_kind: VitalKind,
    pub is_paired: bool,
    pub is_trusted: bool,
}

/// Radio-stack handle for a peripheral that is currently in the live table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeripheralHandle {
    mac: [u8; 6],
}

impl PeripheralHandle {
    pub fn new(mac: [u8; 6]) -> Self {
        Self { mac }
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }
}

/// A peripheral observed during the current scan session
#[derive(Debug, Clone, PartialEq)]
pub struct Peripheral {
    pub address: String,
    pub display_name: Option<String>,
    pub signal_strength: i16,
    pub last_seen_at: OffsetDateTime,
    pub connection_handle: Option<PeripheralHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub device_address: String,
    pub service_id: uuid::Uuid,
    pub characteristic_id: uuid::Uuid,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Discovering,
    Subscribing,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Discovering => "discovering",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStatus {
    Scanning,
    Idle { device_count: usize },
    Error { message: String },
}
