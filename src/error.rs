//! Error types for the ble-central-hub crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// A peripheral identifier could not be parsed.
    #[error("Invalid peripheral identifier: {identifier:?}")]
    InvalidIdentifier {
        /// The rejected identifier text.
        identifier: String,
    },

    /// A service or characteristic UUID could not be parsed.
    #[error("Invalid UUID: {value:?}")]
    InvalidUuid {
        /// The rejected UUID text.
        value: String,
    },

    /// Reading or writing the device store failed.
    #[error("Device store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device store contents could not be encoded or decoded.
    #[error("Device store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A radio operation failed.
    #[error(transparent)]
    Radio(#[from] RadioError),

    /// The manager's serial task is no longer running.
    #[error("Central manager has shut down")]
    ManagerShutdown,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failure reported by the radio for one in-flight operation.
///
/// Cloneable so the same value can be handed to every observer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// The connection attempt failed.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The link dropped without being asked to.
    #[error("Connection lost")]
    ConnectionLost,

    /// The connection attempt did not complete in time.
    #[error("Connection attempt timed out")]
    Timeout,

    /// The radio has no handle for this peripheral.
    #[error("Unknown peripheral: {identifier}")]
    UnknownPeripheral {
        /// The identifier that was looked up.
        identifier: String,
    },

    /// Service discovery failed.
    #[error("Service discovery failed: {reason}")]
    ServiceDiscovery {
        /// Description of the failure.
        reason: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Reading (or enabling notifications on) a characteristic failed.
    #[error("Read failed: {reason}")]
    ReadFailed {
        /// Description of the failure.
        reason: String,
    },

    /// Writing a characteristic failed.
    #[error("Write failed: {reason}")]
    WriteFailed {
        /// Description of the failure.
        reason: String,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radio_error_display() {
        let err = RadioError::ConnectionFailed {
            reason: "peer busy".to_string(),
        };
        assert_eq!(err.to_string(), "Connection failed: peer busy");
        assert_eq!(RadioError::Timeout.to_string(), "Connection attempt timed out");
    }

    #[test]
    fn test_radio_error_is_transparent() {
        let err: Error = RadioError::ConnectionLost.into();
        assert_eq!(err.to_string(), "Connection lost");
    }

    #[test]
    fn test_invalid_identifier_display() {
        let err = Error::InvalidIdentifier {
            identifier: "a b".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid peripheral identifier: \"a b\"");
    }
}
