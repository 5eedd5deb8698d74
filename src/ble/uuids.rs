//! GATT UUID helpers.
//!
//! Service and characteristic identifiers are plain [`Uuid`]s. Text forms
//! accept the full 128-bit representation as well as the 16-bit and 32-bit
//! short forms assigned by the Bluetooth SIG.

use uuid::Uuid;

use crate::error::{Error, Result};

/// The Bluetooth base UUID (`00000000-0000-1000-8000-00805F9B34FB`).
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// Standard BLE Device Information Service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = uuid_from_u16(0x180a);
/// Standard BLE Battery Service UUID.
pub const BATTERY_SERVICE_UUID: Uuid = uuid_from_u16(0x180f);
/// Battery Level characteristic UUID (Read, Notify).
pub const BATTERY_LEVEL_UUID: Uuid = uuid_from_u16(0x2a19);
/// Standard BLE Heart Rate Service UUID.
pub const HEART_RATE_SERVICE_UUID: Uuid = uuid_from_u16(0x180d);
/// Heart Rate Measurement characteristic UUID (Notify).
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = uuid_from_u16(0x2a37);

/// Expand a 16-bit SIG-assigned UUID against the Bluetooth base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Expand a 32-bit SIG-assigned UUID against the Bluetooth base UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Parse a service or characteristic UUID.
///
/// Accepts `"180D"`, `"0000180D"` and the full hyphenated or simple forms.
///
/// # Example
///
/// ```
/// use ble_central_hub::ble::uuids::{parse_uuid, HEART_RATE_SERVICE_UUID};
///
/// assert_eq!(parse_uuid("180D").unwrap(), HEART_RATE_SERVICE_UUID);
/// ```
pub fn parse_uuid(value: &str) -> Result<Uuid> {
    let trimmed = value.trim();
    let invalid = || Error::InvalidUuid {
        value: value.to_string(),
    };

    let is_hex = !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_hexdigit());

    match trimmed.len() {
        4 if is_hex => u16::from_str_radix(trimmed, 16)
            .map(uuid_from_u16)
            .map_err(|_| invalid()),
        8 if is_hex => u32::from_str_radix(trimmed, 16)
            .map(uuid_from_u32)
            .map_err(|_| invalid()),
        _ => Uuid::parse_str(trimmed).map_err(|_| invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            DEVICE_INFO_SERVICE_UUID.to_string(),
            "0000180a-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(uuid_from_u32(0x0000_2a19), BATTERY_LEVEL_UUID);
    }

    #[test]
    fn test_parse_short_forms() {
        assert_eq!(parse_uuid("180f").unwrap(), BATTERY_SERVICE_UUID);
        assert_eq!(parse_uuid("2A37").unwrap(), HEART_RATE_MEASUREMENT_UUID);
        assert_eq!(parse_uuid("00002A19").unwrap(), BATTERY_LEVEL_UUID);
    }

    #[test]
    fn test_parse_full_form() {
        let uuid = parse_uuid("6E400001-B5A3-F393-E0A9-E50E24DCCA9E").unwrap();
        assert_eq!(uuid, Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_uuid("").is_err());
        assert!(parse_uuid("+1AB").is_err());
        assert!(parse_uuid("not-a-uuid").is_err());
        assert!(matches!(
            parse_uuid("12345"),
            Err(Error::InvalidUuid { value }) if value == "12345"
        ));
    }
}
