//! BLE communication module.
//!
//! This module provides the radio boundary and the Bluetooth Low Energy
//! types shared by the rest of the crate: peripheral identifiers,
//! advertisements, link states and GATT UUID helpers.

pub mod advertising;
pub mod btleplug_radio;
pub mod connection;
pub mod peripheral;
pub mod radio;
pub mod simulated;
pub mod uuids;

pub use advertising::Advertisement;
pub use btleplug_radio::BtleplugRadio;
pub use connection::{ConnectionState, LinkState};
pub use peripheral::{DiscoveredPeripheral, GattCharacteristic, PeripheralId};
pub use radio::{
    ConnectOptions, PowerState, RadioCapability, RadioEvent, RadioEventSender, RadioEvents,
    RetrievedPeripheral, ScanOptions,
};
pub use simulated::{RadioRequest, SimulatedRadio};
pub use uuids::*;
