// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-central-hub
//!
//! A Bluetooth Low Energy central-role hub that shares one radio between
//! many independent observers.
//!
//! The hub scans for and connects to peripherals, discovers the services and
//! characteristics each caller asked for, reads and monitors their values,
//! and fans every event out to all registered observers in registration
//! order. Peripherals can be remembered across process restarts so the next
//! scan reacquires and reconnects them without waiting for an advertisement.
//!
//! ## Features
//!
//! - **Subscription replay**: declare services and characteristics per
//!   peripheral; discovery and reads are issued as the radio reports progress
//! - **Multi-observer fan-out**: callbacks keyed by identity with upsert
//!   semantics, plus a broadcast stream of the same events
//! - **Reacquisition**: remembered peripherals persist in a JSON file and are
//!   reconnected on the next scan
//! - **Power handling**: observers hear every usability change; tracked
//!   subscriptions are dropped when the radio becomes unusable
//! - **Connect timeouts**: optional deadline on unanswered connect requests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_central_hub::ble::uuids::HEART_RATE_SERVICE_UUID;
//! use ble_central_hub::{
//!     BtleplugRadio, CentralManager, CoordinatorConfig, JsonFileDeviceStore, Observer,
//!     Result, ScanOptions,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (radio, events) = BtleplugRadio::new().await?;
//!     let store = JsonFileDeviceStore::new("devices.json");
//!     let manager = CentralManager::spawn(radio, events, store, CoordinatorConfig::default());
//!
//!     let _observer = manager
//!         .add_observer(
//!             "console",
//!             Observer::new().on_discovered(|d| println!("Found {} ({:?} dBm)", d.peripheral, d.rssi)),
//!         )
//!         .await?;
//!
//!     manager
//!         .start_scan(ScanOptions::with_services([HEART_RATE_SERVICE_UUID]))
//!         .await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.

// Public modules
pub mod ble;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod manager;
pub mod observer;
pub mod registry;
pub mod subscription;

// Re-exports for convenience
pub use config::CoordinatorConfig;
pub use coordinator::CentralCoordinator;
pub use error::{Error, RadioError, Result};
pub use manager::{CentralManager, ObserverHandle};
pub use observer::{Observer, ObserverEvent, ObserverId, ObserverRegistry};
pub use registry::{
    DeviceRegistry, DeviceStore, JsonFileDeviceStore, MemoryDeviceStore, PersistedDevices,
};
pub use subscription::{SubscriptionSpec, SubscriptionTable, TrackedPeripheral};

// Re-export commonly used types from submodules
pub use ble::{
    Advertisement, BtleplugRadio, ConnectOptions, ConnectionState, DiscoveredPeripheral,
    GattCharacteristic, LinkState, PeripheralId, PowerState, RadioCapability, RadioEvent,
    ScanOptions, SimulatedRadio,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<CentralManager>();
        let _ = std::any::TypeId::of::<CentralCoordinator<SimulatedRadio>>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<Observer>();
        let _ = std::any::TypeId::of::<SubscriptionSpec>();
        let _ = std::any::TypeId::of::<JsonFileDeviceStore>();
        let _ = std::any::TypeId::of::<BtleplugRadio>();
    }
}
