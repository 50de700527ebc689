//! Station identifier fingerprint (`hashId`).
//!
//! A hex digest over the canonical serialization of the station's
//! identity fields, concatenated with the derived station-id string.
//! Immutable for the lifetime of a station; it is the addressing token
//! on the control plane.

use sha2::{Digest, Sha256};

/// Components contributing to a station's `hashId` fingerprint.
pub struct HashIdInput<'a> {
    pub model: &'a str,
    pub vendor: &'a str,
    pub serial_number: Option<&'a str>,
    pub meter_serial_number: Option<&'a str>,
    pub meter_type: Option<&'a str>,
    pub station_id: &'a str,
}

/// Compute the stable `hashId` for a station.
pub fn compute(input: &HashIdInput<'_>) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}",
        input.model,
        input.vendor,
        input.serial_number.unwrap_or(""),
        input.meter_serial_number.unwrap_or(""),
        input.meter_type.unwrap_or(""),
        input.station_id,
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_input() {
        let input = HashIdInput {
            model: "M",
            vendor: "V",
            serial_number: Some("S1"),
            meter_serial_number: None,
            meter_type: None,
            station_id: "CS-0001",
        };
        assert_eq!(compute(&input), compute(&input));
    }

    #[test]
    fn differs_on_station_id() {
        let base = HashIdInput {
            model: "M",
            vendor: "V",
            serial_number: None,
            meter_serial_number: None,
            meter_type: None,
            station_id: "CS-0001",
        };
        let other = HashIdInput {
            station_id: "CS-0002",
            ..base
        };
        assert_ne!(compute(&base), compute(&other));
    }
}
