//! The radio boundary.
//!
//! A [`RadioCapability`] accepts fire-and-forget requests and reports each
//! outcome later as a [`RadioEvent`] on the channel handed out when the radio
//! was created. Every request produces exactly one terminal event; value
//! notifications after a successful subscribe arrive as further
//! [`RadioEvent::ValueUpdated`] events.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ble::connection::ConnectionState;
use crate::ble::peripheral::{DiscoveredPeripheral, GattCharacteristic, PeripheralId};
use crate::error::RadioError;

/// Receiving end of a radio's event stream.
pub type RadioEvents = mpsc::UnboundedReceiver<RadioEvent>;

/// Sending end of a radio's event stream.
pub type RadioEventSender = mpsc::UnboundedSender<RadioEvent>;

/// Power state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PowerState {
    /// State not yet known.
    #[default]
    Unknown,
    /// Radio is restarting.
    Resetting,
    /// This platform has no BLE central support.
    Unsupported,
    /// The process is not allowed to use the radio.
    Unauthorized,
    /// Radio is switched off.
    PoweredOff,
    /// Radio is on and usable.
    PoweredOn,
}

impl PowerState {
    /// Only a powered-on radio accepts scan and connect requests.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::Resetting => "Resetting",
            Self::Unsupported => "Unsupported",
            Self::Unauthorized => "Unauthorized",
            Self::PoweredOff => "PoweredOff",
            Self::PoweredOn => "PoweredOn",
        };
        f.write_str(name)
    }
}

/// Parameters for a scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanOptions {
    /// Only report peripherals advertising one of these services. Empty
    /// means no filter.
    pub services: Vec<Uuid>,
    /// Report every advertisement instead of only the first per peripheral.
    pub allow_duplicates: bool,
}

impl ScanOptions {
    /// Scan for peripherals advertising any of the given services.
    pub fn with_services(services: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            services: services.into_iter().collect(),
            allow_duplicates: false,
        }
    }

    /// Set duplicate reporting.
    pub fn allow_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }
}

/// System alert preferences attached to a connect request.
///
/// These only have an effect on platforms that surface alerts for suspended
/// applications; other radios ignore them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectOptions {
    /// Alert when the connection is made while suspended.
    pub notify_on_connection: bool,
    /// Alert when the connection drops while suspended.
    pub notify_on_disconnection: bool,
    /// Alert for every notification received while suspended.
    pub notify_on_notification: bool,
}

/// A peripheral the radio still holds a handle for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedPeripheral {
    /// The peripheral identifier.
    pub peripheral: PeripheralId,
    /// Last known signal strength.
    pub rssi: Option<i16>,
}

/// Everything the radio reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// The radio's power state changed.
    PowerStateChanged(PowerState),
    /// The platform handed back state preserved from a previous process.
    StateRestored {
        /// Peripherals the platform kept connected or pending.
        peripherals: Vec<PeripheralId>,
        /// Services of a scan that was active at the time.
        scan_services: Vec<Uuid>,
    },
    /// A scan heard a peripheral.
    PeripheralDiscovered(DiscoveredPeripheral),
    /// A connect request succeeded.
    Connected(PeripheralId),
    /// A connect request failed.
    ConnectFailed {
        /// The peripheral.
        peripheral: PeripheralId,
        /// Why the connection failed.
        error: RadioError,
    },
    /// A link went down, requested or not.
    Disconnected {
        /// The peripheral.
        peripheral: PeripheralId,
        /// Set when the link was lost rather than cancelled.
        error: Option<RadioError>,
    },
    /// Outcome of a service discovery request.
    ServicesDiscovered {
        /// The peripheral.
        peripheral: PeripheralId,
        /// Discovered service UUIDs.
        result: Result<Vec<Uuid>, RadioError>,
    },
    /// Outcome of a characteristic discovery request for one service.
    CharacteristicsDiscovered {
        /// The peripheral.
        peripheral: PeripheralId,
        /// The service that was searched.
        service: Uuid,
        /// Discovered characteristic UUIDs.
        result: Result<Vec<Uuid>, RadioError>,
    },
    /// A read completed or a notification arrived.
    ValueUpdated {
        /// The peripheral.
        peripheral: PeripheralId,
        /// The characteristic, carrying the value on success.
        characteristic: GattCharacteristic,
        /// Set when the read failed.
        error: Option<RadioError>,
    },
    /// A write completed.
    WriteCompleted {
        /// The peripheral.
        peripheral: PeripheralId,
        /// The characteristic written.
        characteristic: GattCharacteristic,
        /// Set when the write failed.
        error: Option<RadioError>,
    },
}

impl RadioEvent {
    /// The peripheral this event concerns, if any.
    pub fn peripheral(&self) -> Option<&PeripheralId> {
        match self {
            Self::PowerStateChanged(_) | Self::StateRestored { .. } => None,
            Self::PeripheralDiscovered(d) => Some(&d.peripheral),
            Self::Connected(p) => Some(p),
            Self::ConnectFailed { peripheral, .. }
            | Self::Disconnected { peripheral, .. }
            | Self::ServicesDiscovered { peripheral, .. }
            | Self::CharacteristicsDiscovered { peripheral, .. }
            | Self::ValueUpdated { peripheral, .. }
            | Self::WriteCompleted { peripheral, .. } => Some(peripheral),
        }
    }
}

/// A central-role radio.
///
/// Request methods return as soon as the request is issued. Their outcome is
/// delivered as a [`RadioEvent`].
#[async_trait]
pub trait RadioCapability: Send + Sync {
    /// Current power state.
    fn power_state(&self) -> PowerState;

    /// Check if a scan is active.
    fn is_scanning(&self) -> bool;

    /// Link state of a peripheral as the radio sees it.
    fn connection_state(&self, peripheral: &PeripheralId) -> ConnectionState;

    /// Start scanning.
    fn start_scan(&self, options: &ScanOptions);

    /// Stop scanning.
    fn stop_scan(&self);

    /// Request a connection.
    fn connect(&self, peripheral: &PeripheralId, options: ConnectOptions);

    /// Cancel a connection or pending connect.
    fn cancel_connect(&self, peripheral: &PeripheralId);

    /// Discover every service of a connected peripheral.
    fn discover_services(&self, peripheral: &PeripheralId);

    /// Discover the characteristics of one service.
    fn discover_characteristics(&self, peripheral: &PeripheralId, service: Uuid);

    /// Read a characteristic and keep monitoring it where it supports
    /// notifications.
    fn read_value(&self, peripheral: &PeripheralId, service: Uuid, characteristic: Uuid);

    /// Write a characteristic.
    fn write_value(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        value: Bytes,
        with_response: bool,
    );

    /// Look up peripherals the platform still has a handle for.
    async fn retrieve_peripherals(&self, peripherals: &[PeripheralId]) -> Vec<RetrievedPeripheral>;

    /// Peripherals the platform already holds a connection to that offer one
    /// of the given services. An empty list matches every connected
    /// peripheral.
    async fn retrieve_connected_peripherals(&self, services: &[Uuid]) -> Vec<PeripheralId>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::HEART_RATE_SERVICE_UUID;

    #[test]
    fn test_power_state_usable() {
        assert!(PowerState::PoweredOn.is_usable());
        for state in [
            PowerState::Unknown,
            PowerState::Resetting,
            PowerState::Unsupported,
            PowerState::Unauthorized,
            PowerState::PoweredOff,
        ] {
            assert!(!state.is_usable(), "{state} should not be usable");
        }
    }

    #[test]
    fn test_scan_options_builder() {
        let options = ScanOptions::with_services([HEART_RATE_SERVICE_UUID]).allow_duplicates(true);
        assert_eq!(options.services, vec![HEART_RATE_SERVICE_UUID]);
        assert!(options.allow_duplicates);
        assert!(ScanOptions::default().services.is_empty());
    }

    #[test]
    fn test_event_peripheral() {
        let id = PeripheralId::parse("P1").unwrap();
        assert_eq!(RadioEvent::Connected(id.clone()).peripheral(), Some(&id));
        assert_eq!(
            RadioEvent::PowerStateChanged(PowerState::PoweredOff).peripheral(),
            None
        );
    }
}
