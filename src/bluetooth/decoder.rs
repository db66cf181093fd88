/// GATT measurement decoding for the supported health profiles
///
/// Every supported vital kind is one row in [`PROFILES`]: the service the
/// connection manager discovers, the measurement characteristic it subscribes
/// to, and the function that turns a notification payload into a
/// [`Measurement`]. All unit conversions happen here, so downstream code only
/// ever sees mmHg, kg/lb, °F, percent and mg/dL.
use log::debug;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::DecodeError;
use crate::models::{DecodedReading, Measurement, RawNotification, VitalKind, WeightUnit};
use crate::utils::round_to;

// Unit conversion constants
const KPA_TO_MMHG: f64 = 7.50062;
const WEIGHT_SI_RESOLUTION: f64 = 0.005; // kg per unit
const WEIGHT_IMPERIAL_RESOLUTION: f64 = 0.01; // lb per unit
const KG_PER_L_TO_MG_PER_DL: f64 = 100_000.0;
const MMOL_GLUCOSE_TO_MG_PER_DL: f64 = 18.0182;

// Blood pressure fields
const BP_FLAG_KPA: u8 = 0x01;
const BP_FLAG_TIMESTAMP: u8 = 0x02;
const BP_FLAG_PULSE: u8 = 0x04;
const BP_TIMESTAMP_LEN: usize = 7;
const SFLOAT_NAN: u16 = 0x07FF;

/// Expand a 16-bit Bluetooth SIG assigned number into a full UUID
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5F9B_34FB | ((short as u128) << 96))
}

/// A supported GATT measurement profile
pub struct GattProfile {
    pub kind: VitalKind,
    pub service: Uuid,
    pub characteristic: Uuid,
    decode: fn(&[u8]) -> Result<Measurement, DecodeError>,
}

pub static PROFILES: [GattProfile; 6] = [
    GattProfile {
        kind: VitalKind::HeartRate,
        service: sig_uuid(0x180D),
        characteristic: sig_uuid(0x2A37),
        decode: decode_heart_rate,
    },
    GattProfile {
        kind: VitalKind::BloodPressure,
        service: sig_uuid(0x1810),
        characteristic: sig_uuid(0x2A35),
        decode: decode_blood_pressure,
    },
    GattProfile {
        kind: VitalKind::Weight,
        service: sig_uuid(0x181D),
        characteristic: sig_uuid(0x2A9D),
        decode: decode_weight,
    },
    GattProfile {
        kind: VitalKind::Temperature,
        service: sig_uuid(0x1809),
        characteristic: sig_uuid(0x2A1C),
        decode: decode_temperature,
    },
    GattProfile {
        kind: VitalKind::SpO2,
        service: sig_uuid(0x1822),
        characteristic: sig_uuid(0x2A5F),
        decode: decode_spo2,
    },
    GattProfile {
        kind: VitalKind::Glucose,
        service: sig_uuid(0x1808),
        characteristic: sig_uuid(0x2A18),
        decode: decode_glucose,
    },
];

/// Profile for a vital kind
pub fn profile_for(kind: VitalKind) -> &'static GattProfile {
    let index = match kind {
        VitalKind::HeartRate => 0,
        VitalKind::BloodPressure => 1,
        VitalKind::Weight => 2,
        VitalKind::Temperature => 3,
        VitalKind::SpO2 => 4,
        VitalKind::Glucose => 5,
    };
    &PROFILES[index]
}

/// Profile matching a (service, characteristic) pair, if any
pub fn profile_for_characteristic(service: Uuid, characteristic: Uuid) -> Option<&'static GattProfile> {
    PROFILES
        .iter()
        .find(|profile| profile.service == service && profile.characteristic == characteristic)
}

/// Decode a raw notification into a canonical reading
pub fn decode(
    notification: &RawNotification,
    observed_at: OffsetDateTime,
) -> Result<DecodedReading, DecodeError> {
    let measurement = decode_payload(
        notification.service_id,
        notification.characteristic_id,
        &notification.payload,
    )?;

    Ok(DecodedReading {
        device_address: notification.device_address.clone(),
        observed_at,
        measurement,
    })
}

/// Decode a characteristic payload without any device context
pub fn decode_payload(
    service: Uuid,
    characteristic: Uuid,
    payload: &[u8],
) -> Result<Measurement, DecodeError> {
    let profile = profile_for_characteristic(service, characteristic).ok_or(
        DecodeError::UnknownCharacteristic {
            service,
            characteristic,
        },
    )?;
    (profile.decode)(payload)
}

fn require(payload: &[u8], expected: usize) -> Result<(), DecodeError> {
    if payload.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn u16_at(payload: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([payload[offset], payload[offset + 1]])
}

fn i16_at(payload: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([payload[offset], payload[offset + 1]])
}

/// Parse an IEEE-11073 16-bit SFLOAT (4-bit exponent, 12-bit mantissa)
pub fn sfloat(raw: u16) -> Result<f64, DecodeError> {
    // NaN, NRes, +INF, -INF and the reserved pattern
    if matches!(raw, 0x07FE..=0x0802) {
        return Err(DecodeError::ReservedValue(u32::from(raw)));
    }

    let mut mantissa = i32::from(raw & 0x0FFF);
    if mantissa >= 0x0800 {
        mantissa -= 0x1000;
    }
    let mut exponent = i32::from(raw >> 12);
    if exponent >= 0x08 {
        exponent -= 0x10;
    }

    Ok(f64::from(mantissa) * 10f64.powi(exponent))
}

/// Parse an IEEE-11073 32-bit FLOAT (8-bit exponent, 24-bit mantissa)
pub fn float32(raw: u32) -> Result<f64, DecodeError> {
    let bits = raw & 0x00FF_FFFF;
    if matches!(bits, 0x007F_FFFE | 0x007F_FFFF | 0x0080_0000..=0x0080_0002) {
        return Err(DecodeError::ReservedValue(raw));
    }

    let mut mantissa = bits as i32;
    if mantissa >= 0x0080_0000 {
        mantissa -= 0x0100_0000;
    }
    let exponent = i32::from((raw >> 24) as u8 as i8);

    Ok(f64::from(mantissa) * 10f64.powi(exponent))
}

/// Heart Rate Measurement (0x2A37)
///
/// - Byte 0: flags (bit 0 = 16-bit BPM, bit 1 = contact detected, bit 2 = contact supported)
/// - Byte 1 or bytes 1-2: BPM
fn decode_heart_rate(payload: &[u8]) -> Result<Measurement, DecodeError> {
    require(payload, 1)?;
    let flags = payload[0];

    let bpm = if flags & 0x01 != 0 {
        require(payload, 3)?;
        u16_at(payload, 1)
    } else {
        require(payload, 2)?;
        u16::from(payload[1])
    };

    let contact_supported = flags & 0x04 != 0;
    let contact_detected = flags & 0x02 != 0;
    if contact_supported && !contact_detected {
        debug!("Heart rate sensor reports no skin contact ({} bpm)", bpm);
    }

    Ok(Measurement::HeartRate { bpm })
}

/// Blood Pressure Measurement (0x2A35)
///
/// - Byte 0: flags (bit 0 = kPa, bit 1 = time stamp present, bit 2 = pulse present)
/// - Bytes 1-2, 3-4, 5-6: systolic, diastolic, mean arterial pressure (signed 16-bit LE)
/// - Bytes 7-13: time stamp, when flagged
/// - Next 2 bytes: pulse rate, when flagged
fn decode_blood_pressure(payload: &[u8]) -> Result<Measurement, DecodeError> {
    require(payload, 7)?;
    let flags = payload[0];
    let kpa = flags & BP_FLAG_KPA != 0;

    let to_mmhg = |raw: i16| -> i32 {
        if kpa {
            (f64::from(raw) * KPA_TO_MMHG).round() as i32
        } else {
            i32::from(raw)
        }
    };

    let systolic_mmhg = to_mmhg(i16_at(payload, 1));
    let diastolic_mmhg = to_mmhg(i16_at(payload, 3));
    let mean_arterial_pressure_mmhg = match u16_at(payload, 5) {
        SFLOAT_NAN => None,
        _ => Some(to_mmhg(i16_at(payload, 5))),
    };

    let pulse_bpm = if flags & BP_FLAG_PULSE != 0 {
        let mut offset = 7;
        if flags & BP_FLAG_TIMESTAMP != 0 {
            offset += BP_TIMESTAMP_LEN;
        }
        require(payload, offset + 2)?;
        Some(i32::from(i16_at(payload, offset)))
    } else {
        None
    };

    Ok(Measurement::BloodPressure {
        systolic_mmhg,
        diastolic_mmhg,
        mean_arterial_pressure_mmhg,
        pulse_bpm,
    })
}

/// Weight Measurement (0x2A9D)
///
/// - Byte 0: flags (bit 0 = imperial)
/// - Bytes 1-2: weight (unsigned 16-bit LE, 0.005 kg or 0.01 lb resolution)
fn decode_weight(payload: &[u8]) -> Result<Measurement, DecodeError> {
    require(payload, 3)?;
    let raw = f64::from(u16_at(payload, 1));

    let (value, unit) = if payload[0] & 0x01 != 0 {
        (raw * WEIGHT_IMPERIAL_RESOLUTION, WeightUnit::Lb)
    } else {
        (raw * WEIGHT_SI_RESOLUTION, WeightUnit::Kg)
    };

    Ok(Measurement::Weight {
        value: round_to(value, 1),
        unit,
    })
}

/// Temperature Measurement (0x2A1C)
///
/// - Byte 0: flags (bit 0 = Fahrenheit)
/// - Bytes 1-4: IEEE-11073 FLOAT (24-bit mantissa, 8-bit exponent)
fn decode_temperature(payload: &[u8]) -> Result<Measurement, DecodeError> {
    require(payload, 5)?;
    let raw = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
    let value = float32(raw)?;

    let value_fahrenheit = if payload[0] & 0x01 != 0 {
        value
    } else {
        value * 9.0 / 5.0 + 32.0
    };

    Ok(Measurement::Temperature {
        value_fahrenheit: round_to(value_fahrenheit, 1),
    })
}

/// PLX Continuous Measurement (0x2A5F)
///
/// - Byte 0: flags
/// - Bytes 1-2: SpO2 (SFLOAT, percent)
/// - Bytes 3-4: pulse rate (SFLOAT, bpm)
fn decode_spo2(payload: &[u8]) -> Result<Measurement, DecodeError> {
    require(payload, 5)?;
    let percent = sfloat(u16_at(payload, 1))?;
    let pulse_bpm = sfloat(u16_at(payload, 3)).ok().map(|bpm| round_to(bpm, 0));

    Ok(Measurement::SpO2 {
        percent: round_to(percent, 1),
        pulse_bpm,
    })
}

/// Glucose Measurement (0x2A18)
///
/// - Byte 0: flags (bit 0 = time offset, bit 1 = concentration present, bit 2 = mol/L)
/// - Bytes 1-2: sequence number
/// - Bytes 3-9: base time
/// - Optional 2-byte time offset, then the concentration SFLOAT
fn decode_glucose(payload: &[u8]) -> Result<Measurement, DecodeError> {
    require(payload, 10)?;
    let flags = payload[0];

    if flags & 0x02 == 0 {
        return Err(DecodeError::NoMeasurement);
    }

    let offset = if flags & 0x01 != 0 { 12 } else { 10 };
    require(payload, offset + 2)?;
    let concentration = sfloat(u16_at(payload, offset))?;

    let mg_per_dl = if flags & 0x04 != 0 {
        concentration * 1000.0 * MMOL_GLUCOSE_TO_MG_PER_DL
    } else {
        concentration * KG_PER_L_TO_MG_PER_DL
    };

    Ok(Measurement::Glucose {
        mg_per_dl: round_to(mg_per_dl, 1),
    })
}
