/// Utility functions for formatting, rounding and address handling
use time::macros::format_description;
use time::OffsetDateTime;

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    dt.format(format_description!("[day].[month].[year] - [hour]:[minute]:[second]"))
        .unwrap_or_else(|_| dt.to_string())
}

/// Round a value to the given number of decimal places
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Normalize a MAC-style device address for use as a table key
///
/// Addresses are trimmed, uppercased and use ':' separators, so
/// `aa-bb-cc-dd-ee-ff` and `AA:BB:CC:DD:EE:FF` name the same device.
pub fn normalize_address(address: &str) -> String {
    address.trim().replace('-', ":").to_uppercase()
}

/// Parse a normalized MAC address into its six bytes
pub fn parse_mac(address: &str) -> Option<[u8; 6]> {
    let normalized = normalize_address(address);
    let mut bytes = [0u8; 6];
    let mut parts = normalized.split(':');
    for byte in bytes.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(bytes)
}

/// Format six MAC bytes as an uppercase colon-separated address
pub fn format_mac(bytes: &[u8; 6]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
