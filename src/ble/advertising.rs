//! Advertisement contents.
//!
//! Payloads are kept opaque: the hub only needs enough structure to hand a
//! discovery to observers and to apply a service filter.

use btleplug::api::PeripheralProperties;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Everything a peripheral said about itself in its advertising packets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advertisement {
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Manufacturer-specific data keyed by company identifier.
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    /// Service data keyed by service UUID.
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Advertised transmit power in dBm.
    pub tx_power_level: Option<i16>,
}

impl Advertisement {
    /// Create an advertisement carrying only a local name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            local_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Add an advertised service UUID.
    pub fn with_service(mut self, service: Uuid) -> Self {
        if !self.services.contains(&service) {
            self.services.push(service);
        }
        self
    }

    /// Manufacturer payload for a company identifier.
    pub fn manufacturer_payload(&self, company_id: u16) -> Option<&[u8]> {
        self.manufacturer_data.get(&company_id).map(Vec::as_slice)
    }

    /// Check if a service is advertised, either in the service list or as
    /// service data.
    pub fn advertises_service(&self, service: &Uuid) -> bool {
        self.services.contains(service) || self.service_data.contains_key(service)
    }

    /// Check the advertisement against a scan filter.
    ///
    /// An empty filter matches everything.
    pub fn matches_filter(&self, services: &[Uuid]) -> bool {
        services.is_empty() || services.iter().any(|s| self.advertises_service(s))
    }
}

impl From<&PeripheralProperties> for Advertisement {
    fn from(properties: &PeripheralProperties) -> Self {
        Self {
            local_name: properties.local_name.clone(),
            manufacturer_data: properties
                .manufacturer_data
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            service_data: properties
                .service_data
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            services: properties.services.clone(),
            tx_power_level: properties.tx_power_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{BATTERY_SERVICE_UUID, HEART_RATE_SERVICE_UUID};

    #[test]
    fn test_named_advertisement() {
        let adv = Advertisement::named("Polar H10");
        assert_eq!(adv.local_name.as_deref(), Some("Polar H10"));
        assert!(adv.services.is_empty());
    }

    #[test]
    fn test_advertises_service() {
        let mut adv = Advertisement::default().with_service(HEART_RATE_SERVICE_UUID);
        assert!(adv.advertises_service(&HEART_RATE_SERVICE_UUID));
        assert!(!adv.advertises_service(&BATTERY_SERVICE_UUID));

        adv.service_data.insert(BATTERY_SERVICE_UUID, vec![0x55]);
        assert!(adv.advertises_service(&BATTERY_SERVICE_UUID));
    }

    #[test]
    fn test_with_service_is_deduplicated() {
        let adv = Advertisement::default()
            .with_service(HEART_RATE_SERVICE_UUID)
            .with_service(HEART_RATE_SERVICE_UUID);
        assert_eq!(adv.services.len(), 1);
    }

    #[test]
    fn test_matches_filter() {
        let adv = Advertisement::default().with_service(HEART_RATE_SERVICE_UUID);
        assert!(adv.matches_filter(&[]));
        assert!(adv.matches_filter(&[BATTERY_SERVICE_UUID, HEART_RATE_SERVICE_UUID]));
        assert!(!adv.matches_filter(&[BATTERY_SERVICE_UUID]));
    }

    #[test]
    fn test_manufacturer_payload() {
        let mut adv = Advertisement::default();
        adv.manufacturer_data.insert(0x004c, vec![0x02, 0x15]);
        assert_eq!(adv.manufacturer_payload(0x004c), Some(&[0x02, 0x15][..]));
        assert_eq!(adv.manufacturer_payload(0x09c7), None);
    }

    #[test]
    fn test_from_properties() {
        let mut properties = PeripheralProperties::default();
        properties.local_name = Some("Thingy".to_string());
        properties.services = vec![BATTERY_SERVICE_UUID];
        properties.tx_power_level = Some(-4);

        let adv = Advertisement::from(&properties);
        assert_eq!(adv.local_name.as_deref(), Some("Thingy"));
        assert!(adv.advertises_service(&BATTERY_SERVICE_UUID));
        assert_eq!(adv.tx_power_level, Some(-4));
    }
}
