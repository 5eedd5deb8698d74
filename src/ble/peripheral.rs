//! Peripheral identity and the per-peripheral values carried by events.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::ble::advertising::Advertisement;
use crate::error::{Error, Result};

/// Stable identifier for one physical peripheral across process restarts.
///
/// Treated as opaque text: UUID strings, BD addresses and platform handles
/// are all accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Parse an identifier, rejecting empty text and text containing
    /// whitespace or control characters.
    pub fn parse(value: &str) -> Result<Self> {
        let valid = !value.is_empty()
            && !value
                .chars()
                .any(|c| c.is_whitespace() || c.is_control());

        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(Error::InvalidIdentifier {
                identifier: value.to_string(),
            })
        }
    }

    /// The identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for PeripheralId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl AsRef<str> for PeripheralId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A peripheral seen by a scan or re-identified from the persisted list.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeripheral {
    /// The peripheral identifier.
    pub peripheral: PeripheralId,
    /// Advertisement contents; `None` when the peripheral was re-identified
    /// rather than heard advertising.
    pub advertisement: Option<Advertisement>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

/// A characteristic together with its last known value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// The service the characteristic belongs to.
    pub service: Uuid,
    /// The characteristic UUID.
    pub uuid: Uuid,
    /// Last value read, notified or written.
    pub value: Option<Bytes>,
}

impl GattCharacteristic {
    /// Create a characteristic reference without a value.
    pub fn new(service: Uuid, uuid: Uuid) -> Self {
        Self {
            service,
            uuid,
            value: None,
        }
    }

    /// Attach a value.
    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID};

    #[test]
    fn test_peripheral_id_accepts_opaque_forms() {
        assert!(PeripheralId::parse("P1").is_ok());
        assert!(PeripheralId::parse("C8:3F:26:12:00:AB").is_ok());
        assert!(PeripheralId::parse("7D0F3C5E-4B8A-4C2E-9F5D-2A1B3C4D5E6F").is_ok());
        assert!(PeripheralId::parse("/org/bluez/hci0/dev_C8_3F_26_12_00_AB").is_ok());
    }

    #[test]
    fn test_peripheral_id_rejects_blank_or_spaced() {
        assert!(PeripheralId::parse("").is_err());
        assert!(PeripheralId::parse("two words").is_err());
        assert!(PeripheralId::parse("tab\there").is_err());
        assert!("line\n".parse::<PeripheralId>().is_err());
    }

    #[test]
    fn test_peripheral_id_display() {
        let id = PeripheralId::parse("P1").unwrap();
        assert_eq!(id.to_string(), "P1");
        assert_eq!(id.as_str(), "P1");
    }

    #[test]
    fn test_characteristic_with_value() {
        let c = GattCharacteristic::new(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID)
            .with_value(vec![87u8]);
        assert_eq!(c.value.as_deref(), Some(&[87u8][..]));
    }
}
