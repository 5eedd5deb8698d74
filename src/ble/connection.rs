//! Connection states.
//!
//! [`ConnectionState`] is what the radio reports for a link. [`LinkState`]
//! is the hub's own view of how far a tracked peripheral has progressed
//! through connect and subscription replay.

use std::collections::BTreeSet;
use uuid::Uuid;

/// Link state as reported by the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected to the peripheral.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected to the peripheral.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Progress of a tracked peripheral.
///
/// Disconnected and failed peripherals are not tracked at all, so they have
/// no variant here.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Connect request issued, waiting for the radio.
    #[default]
    Connecting,
    /// Link is up, service discovery not yet requested.
    Connected,
    /// Waiting for the services of the peripheral.
    DiscoveringServices,
    /// Waiting for characteristics of the listed services.
    DiscoveringCharacteristics {
        /// Services whose characteristic discovery has not completed.
        pending: BTreeSet<Uuid>,
    },
    /// Every requested service has been handled; values flow.
    Subscribed,
}

impl LinkState {
    /// Check if the link has been established.
    pub fn is_connected(&self) -> bool {
        !matches!(self, Self::Connecting)
    }

    /// Check if the service is awaiting characteristic discovery.
    pub fn is_pending(&self, service: &Uuid) -> bool {
        match self {
            Self::DiscoveringCharacteristics { pending } => pending.contains(service),
            _ => false,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::DiscoveringServices => "DiscoveringServices",
            Self::DiscoveringCharacteristics { .. } => "DiscoveringCharacteristics",
            Self::Subscribed => "Subscribed",
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{BATTERY_SERVICE_UUID, HEART_RATE_SERVICE_UUID};

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());

        assert!(ConnectionState::Connecting.is_transitioning());
        assert!(ConnectionState::Disconnecting.is_transitioning());
        assert!(!ConnectionState::Connected.is_transitioning());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Connected), "Connected");
        assert_eq!(format!("{}", ConnectionState::Disconnected), "Disconnected");
    }

    #[test]
    fn test_link_state_pending() {
        let state = LinkState::DiscoveringCharacteristics {
            pending: [HEART_RATE_SERVICE_UUID].into_iter().collect(),
        };
        assert!(state.is_pending(&HEART_RATE_SERVICE_UUID));
        assert!(!state.is_pending(&BATTERY_SERVICE_UUID));
        assert!(!LinkState::Subscribed.is_pending(&HEART_RATE_SERVICE_UUID));
    }

    #[test]
    fn test_link_state_connected() {
        assert!(!LinkState::Connecting.is_connected());
        assert!(LinkState::DiscoveringServices.is_connected());
        assert_eq!(LinkState::Subscribed.to_string(), "Subscribed");
    }
}
