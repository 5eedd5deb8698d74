//! Radio backed by a btleplug adapter.
//!
//! Every request is carried out on its own spawned task and reported through
//! the radio event channel. Adapter events (power, discovery, link changes)
//! are pumped by one long-lived task.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::advertising::Advertisement;
use crate::ble::connection::ConnectionState;
use crate::ble::peripheral::{DiscoveredPeripheral, GattCharacteristic, PeripheralId};
use crate::ble::radio::{
    ConnectOptions, PowerState, RadioCapability, RadioEvent, RadioEventSender, RadioEvents,
    RetrievedPeripheral, ScanOptions,
};
use crate::error::{Error, RadioError, Result};

/// Translate the adapter state.
fn power_from(state: CentralState) -> PowerState {
    #[allow(unreachable_patterns)]
    match state {
        CentralState::PoweredOn => PowerState::PoweredOn,
        CentralState::PoweredOff => PowerState::PoweredOff,
        _ => PowerState::Unknown,
    }
}

/// The event reporting a link going down, given the state it was in.
///
/// A link we were tearing down ends cleanly; a pending connect ends as a
/// failure; an established link ends as a loss.
fn link_down_event(
    peripheral: &PeripheralId,
    previous: ConnectionState,
    error: Option<RadioError>,
) -> Option<RadioEvent> {
    match previous {
        ConnectionState::Disconnected => None,
        ConnectionState::Disconnecting => Some(RadioEvent::Disconnected {
            peripheral: peripheral.clone(),
            error: None,
        }),
        ConnectionState::Connecting => Some(RadioEvent::ConnectFailed {
            peripheral: peripheral.clone(),
            error: error.unwrap_or(RadioError::ConnectionLost),
        }),
        ConnectionState::Connected => Some(RadioEvent::Disconnected {
            peripheral: peripheral.clone(),
            error: Some(error.unwrap_or(RadioError::ConnectionLost)),
        }),
    }
}

fn our_id(id: &btleplug::platform::PeripheralId) -> Option<PeripheralId> {
    match PeripheralId::parse(&id.to_string()) {
        Ok(id) => Some(id),
        Err(e) => {
            trace!("Ignoring peripheral {:?}: {}", id, e);
            None
        }
    }
}

fn find_characteristic(peripheral: &Peripheral, service: Uuid, uuid: Uuid) -> Option<Characteristic> {
    peripheral
        .services()
        .into_iter()
        .find(|s| s.uuid == service)?
        .characteristics
        .into_iter()
        .find(|c| c.uuid == uuid)
}

/// State shared between the radio handle and its tasks.
struct Shared {
    adapter: Adapter,
    events_tx: RadioEventSender,
    power: RwLock<PowerState>,
    scanning: AtomicBool,
    scan_options: RwLock<ScanOptions>,
    /// Peripheral handles by identifier.
    peripherals: RwLock<HashMap<PeripheralId, Peripheral>>,
    links: RwLock<HashMap<PeripheralId, ConnectionState>>,
    /// Notification listeners by peripheral.
    notification_tasks: Mutex<HashMap<PeripheralId, JoinHandle<()>>>,
}

impl Shared {
    fn emit(&self, event: RadioEvent) {
        trace!("Radio event: {:?}", event);
        // The receiver may already be gone.
        let _ = self.events_tx.send(event);
    }

    fn link(&self, peripheral: &PeripheralId) -> ConnectionState {
        self.links.read().get(peripheral).copied().unwrap_or_default()
    }

    /// Set a link state, returning the previous one.
    fn set_link(&self, peripheral: &PeripheralId, state: ConnectionState) -> ConnectionState {
        self.links
            .write()
            .insert(peripheral.clone(), state)
            .unwrap_or_default()
    }

    async fn peripheral(&self, id: &PeripheralId) -> Option<Peripheral> {
        let cached = self.peripherals.read().get(id).cloned();
        if cached.is_some() {
            return cached;
        }

        let peripherals = match self.adapter.peripherals().await {
            Ok(peripherals) => peripherals,
            Err(e) => {
                warn!("Failed to list peripherals: {}", e);
                return None;
            }
        };
        let peripheral = peripherals
            .into_iter()
            .find(|p| p.id().to_string() == id.as_str())?;
        self.peripherals
            .write()
            .insert(id.clone(), peripheral.clone());
        Some(peripheral)
    }

    fn link_up(self: &Arc<Self>, id: &PeripheralId, peripheral: Peripheral) {
        let previous = self.set_link(id, ConnectionState::Connected);
        if previous == ConnectionState::Connected {
            return;
        }
        info!("Link to {} is up", id);
        self.start_notifications(id, peripheral);
        self.emit(RadioEvent::Connected(id.clone()));
    }

    fn link_down(&self, id: &PeripheralId, error: Option<RadioError>) {
        let previous = self.set_link(id, ConnectionState::Disconnected);
        if let Some(task) = self.notification_tasks.lock().remove(id) {
            task.abort();
        }
        if let Some(event) = link_down_event(id, previous, error) {
            self.emit(event);
        }
    }

    fn start_notifications(self: &Arc<Self>, id: &PeripheralId, peripheral: Peripheral) {
        let shared = self.clone();
        let peripheral_id = id.clone();

        let handle = tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    error!("Failed to get notifications stream for {}: {}", peripheral_id, e);
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                trace!(
                    "Notification from {}: {} bytes on {}",
                    peripheral_id,
                    notification.value.len(),
                    notification.uuid
                );
                let service = peripheral
                    .services()
                    .into_iter()
                    .find(|s| s.characteristics.iter().any(|c| c.uuid == notification.uuid))
                    .map(|s| s.uuid)
                    .unwrap_or_default();

                shared.emit(RadioEvent::ValueUpdated {
                    peripheral: peripheral_id.clone(),
                    characteristic: GattCharacteristic::new(service, notification.uuid)
                        .with_value(notification.value),
                    error: None,
                });
            }

            debug!("Notification listener for {} stopped", peripheral_id);
        });

        if let Some(old) = self.notification_tasks.lock().insert(id.clone(), handle) {
            old.abort();
        }
    }

    async fn handle_central_event(self: &Arc<Self>, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id) => {
                trace!("Device discovered: {:?}", id);
                self.report_discovery(&id).await;
            }
            CentralEvent::DeviceUpdated(id) => {
                let allow_duplicates = self.scan_options.read().allow_duplicates;
                if allow_duplicates {
                    self.report_discovery(&id).await;
                }
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
                let Some(ours) = our_id(&id) else { return };
                // Only completes a connect we asked for.
                if self.link(&ours) != ConnectionState::Connecting {
                    return;
                }
                if let Some(peripheral) = self.peripheral(&ours).await {
                    self.link_up(&ours, peripheral);
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                if let Some(ours) = our_id(&id) {
                    self.link_down(&ours, None);
                }
            }
            CentralEvent::StateUpdate(state) => {
                let power = power_from(state);
                info!("Adapter state: {}", power);
                *self.power.write() = power;
                if !power.is_usable() {
                    self.scanning.store(false, Ordering::SeqCst);
                }
                self.emit(RadioEvent::PowerStateChanged(power));
            }
            CentralEvent::ManufacturerDataAdvertisement { .. }
            | CentralEvent::ServiceDataAdvertisement { .. }
            | CentralEvent::ServicesAdvertisement { .. } => {}
        }
    }

    async fn report_discovery(&self, id: &btleplug::platform::PeripheralId) {
        if !self.scanning.load(Ordering::SeqCst) {
            return;
        }
        let Some(ours) = our_id(id) else { return };

        let peripheral = match self.adapter.peripheral(id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };
        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let advertisement = Advertisement::from(&properties);
        let wanted = self.scan_options.read().services.clone();
        if !advertisement.matches_filter(&wanted) {
            return;
        }

        self.peripherals.write().insert(ours.clone(), peripheral);
        self.emit(RadioEvent::PeripheralDiscovered(DiscoveredPeripheral {
            peripheral: ours,
            advertisement: Some(advertisement),
            rssi: properties.rssi,
        }));
    }
}

/// A [`RadioCapability`] over the first (or a given) btleplug adapter.
pub struct BtleplugRadio {
    shared: Arc<Shared>,
    event_pump: JoinHandle<()>,
}

impl BtleplugRadio {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BluetoothUnavailable`] if there is no usable adapter.
    pub async fn new() -> Result<(Self, RadioEvents)> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter).await
    }

    /// Use a specific adapter.
    ///
    /// The adapter is assumed powered on until it reports otherwise.
    pub async fn with_adapter(adapter: Adapter) -> Result<(Self, RadioEvents)> {
        let central_events = adapter.events().await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            adapter,
            events_tx,
            power: RwLock::new(PowerState::PoweredOn),
            scanning: AtomicBool::new(false),
            scan_options: RwLock::new(ScanOptions::default()),
            peripherals: RwLock::new(HashMap::new()),
            links: RwLock::new(HashMap::new()),
            notification_tasks: Mutex::new(HashMap::new()),
        });

        let event_pump = tokio::spawn(pump(shared.clone(), central_events));

        Ok((Self { shared, event_pump }, events_rx))
    }

    /// The underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.shared.adapter
    }
}

async fn pump(shared: Arc<Shared>, mut events: impl Stream<Item = CentralEvent> + Unpin) {
    while let Some(event) = events.next().await {
        shared.handle_central_event(event).await;
    }
    debug!("Adapter event stream ended");
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.event_pump.abort();
        for (_, task) in self.shared.notification_tasks.lock().drain() {
            task.abort();
        }
    }
}

#[async_trait]
impl RadioCapability for BtleplugRadio {
    fn power_state(&self) -> PowerState {
        *self.shared.power.read()
    }

    fn is_scanning(&self) -> bool {
        self.shared.scanning.load(Ordering::SeqCst)
    }

    fn connection_state(&self, peripheral: &PeripheralId) -> ConnectionState {
        self.shared.link(peripheral)
    }

    fn start_scan(&self, options: &ScanOptions) {
        *self.shared.scan_options.write() = options.clone();
        self.shared.scanning.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let filter = ScanFilter {
            services: options.services.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = shared.adapter.start_scan(filter).await {
                warn!("Failed to start scan: {}", e);
                shared.scanning.store(false, Ordering::SeqCst);
            }
        });
    }

    fn stop_scan(&self) {
        self.shared.scanning.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
    }

    fn connect(&self, peripheral: &PeripheralId, options: ConnectOptions) {
        if options != ConnectOptions::default() {
            debug!("Connection alerts are not supported by this adapter");
        }
        self.shared.set_link(peripheral, ConnectionState::Connecting);

        let shared = self.shared.clone();
        let id = peripheral.clone();
        tokio::spawn(async move {
            let Some(handle) = shared.peripheral(&id).await else {
                shared.link_down(
                    &id,
                    Some(RadioError::UnknownPeripheral {
                        identifier: id.to_string(),
                    }),
                );
                return;
            };

            match handle.connect().await {
                Ok(()) => match shared.link(&id) {
                    ConnectionState::Connecting => shared.link_up(&id, handle),
                    ConnectionState::Disconnecting => {
                        // Cancelled while connecting; the cancel reports it.
                        let _ = handle.disconnect().await;
                    }
                    _ => {}
                },
                Err(e) => {
                    if shared.link(&id) == ConnectionState::Connecting {
                        shared.link_down(
                            &id,
                            Some(RadioError::ConnectionFailed {
                                reason: e.to_string(),
                            }),
                        );
                    }
                }
            }
        });
    }

    fn cancel_connect(&self, peripheral: &PeripheralId) {
        if self.shared.link(peripheral) == ConnectionState::Disconnected {
            return;
        }
        self.shared
            .set_link(peripheral, ConnectionState::Disconnecting);

        let shared = self.shared.clone();
        let id = peripheral.clone();
        tokio::spawn(async move {
            if let Some(handle) = shared.peripheral(&id).await {
                if let Err(e) = handle.disconnect().await {
                    warn!("Error disconnecting {}: {}", id, e);
                }
            }
            shared.link_down(&id, None);
        });
    }

    fn discover_services(&self, peripheral: &PeripheralId) {
        let shared = self.shared.clone();
        let id = peripheral.clone();
        tokio::spawn(async move {
            let result = match shared.peripheral(&id).await {
                Some(handle) => match handle.discover_services().await {
                    Ok(()) => Ok(handle.services().into_iter().map(|s| s.uuid).collect()),
                    Err(e) => Err(RadioError::ServiceDiscovery {
                        reason: e.to_string(),
                    }),
                },
                None => Err(RadioError::UnknownPeripheral {
                    identifier: id.to_string(),
                }),
            };
            shared.emit(RadioEvent::ServicesDiscovered {
                peripheral: id,
                result,
            });
        });
    }

    fn discover_characteristics(&self, peripheral: &PeripheralId, service: Uuid) {
        // btleplug discovers characteristics along with their services.
        let shared = self.shared.clone();
        let id = peripheral.clone();
        tokio::spawn(async move {
            let result = match shared.peripheral(&id).await {
                Some(handle) => handle
                    .services()
                    .into_iter()
                    .find(|s| s.uuid == service)
                    .map(|s| s.characteristics.into_iter().map(|c| c.uuid).collect())
                    .ok_or_else(|| RadioError::ServiceNotFound {
                        uuid: service.to_string(),
                    }),
                None => Err(RadioError::UnknownPeripheral {
                    identifier: id.to_string(),
                }),
            };
            shared.emit(RadioEvent::CharacteristicsDiscovered {
                peripheral: id,
                service,
                result,
            });
        });
    }

    fn read_value(&self, peripheral: &PeripheralId, service: Uuid, characteristic: Uuid) {
        let shared = self.shared.clone();
        let id = peripheral.clone();
        tokio::spawn(async move {
            let target = GattCharacteristic::new(service, characteristic);
            let found = match shared.peripheral(&id).await {
                Some(handle) => find_characteristic(&handle, service, characteristic)
                    .map(|c| (handle, c))
                    .ok_or_else(|| RadioError::CharacteristicNotFound {
                        uuid: characteristic.to_string(),
                    }),
                None => Err(RadioError::UnknownPeripheral {
                    identifier: id.to_string(),
                }),
            };
            let (handle, found) = match found {
                Ok(found) => found,
                Err(e) => {
                    shared.emit(RadioEvent::ValueUpdated {
                        peripheral: id,
                        characteristic: target,
                        error: Some(e),
                    });
                    return;
                }
            };

            if found
                .properties
                .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
            {
                debug!("Subscribing to {} on {}", characteristic, id);
                if let Err(e) = handle.subscribe(&found).await {
                    shared.emit(RadioEvent::ValueUpdated {
                        peripheral: id.clone(),
                        characteristic: target.clone(),
                        error: Some(RadioError::ReadFailed {
                            reason: e.to_string(),
                        }),
                    });
                    return;
                }
            }

            if !found.properties.contains(CharPropFlags::READ) {
                // Values arrive as notifications.
                return;
            }

            let event = match handle.read(&found).await {
                Ok(value) => {
                    trace!("Read {} bytes from {}", value.len(), characteristic);
                    RadioEvent::ValueUpdated {
                        peripheral: id,
                        characteristic: target.with_value(value),
                        error: None,
                    }
                }
                Err(e) => RadioEvent::ValueUpdated {
                    peripheral: id,
                    characteristic: target,
                    error: Some(RadioError::ReadFailed {
                        reason: e.to_string(),
                    }),
                },
            };
            shared.emit(event);
        });
    }

    fn write_value(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        value: Bytes,
        with_response: bool,
    ) {
        let shared = self.shared.clone();
        let id = peripheral.clone();
        tokio::spawn(async move {
            let target = GattCharacteristic::new(service, characteristic).with_value(value.clone());
            let write_type = if with_response {
                WriteType::WithResponse
            } else {
                WriteType::WithoutResponse
            };

            let result = match shared.peripheral(&id).await {
                Some(handle) => match find_characteristic(&handle, service, characteristic) {
                    Some(found) => handle
                        .write(&found, &value, write_type)
                        .await
                        .map_err(|e| RadioError::WriteFailed {
                            reason: e.to_string(),
                        }),
                    None => Err(RadioError::CharacteristicNotFound {
                        uuid: characteristic.to_string(),
                    }),
                },
                None => Err(RadioError::UnknownPeripheral {
                    identifier: id.to_string(),
                }),
            };

            if result.is_ok() {
                trace!("Wrote {} bytes to {}", value.len(), characteristic);
            }
            shared.emit(RadioEvent::WriteCompleted {
                peripheral: id,
                characteristic: target,
                error: result.err(),
            });
        });
    }

    async fn retrieve_peripherals(&self, peripherals: &[PeripheralId]) -> Vec<RetrievedPeripheral> {
        let mut retrieved = Vec::new();
        for id in peripherals {
            let Some(handle) = self.shared.peripheral(id).await else {
                continue;
            };
            let rssi = handle.properties().await.ok().flatten().and_then(|p| p.rssi);
            retrieved.push(RetrievedPeripheral {
                peripheral: id.clone(),
                rssi,
            });
        }
        retrieved
    }

    async fn retrieve_connected_peripherals(&self, services: &[Uuid]) -> Vec<PeripheralId> {
        let handles = match self.shared.adapter.peripherals().await {
            Ok(handles) => handles,
            Err(e) => {
                warn!("Failed to list peripherals: {}", e);
                return Vec::new();
            }
        };

        let mut connected = Vec::new();
        for handle in handles {
            if !handle.is_connected().await.unwrap_or(false) {
                continue;
            }
            let Some(id) = our_id(&handle.id()) else {
                continue;
            };

            let mut offered: Vec<Uuid> = handle.services().into_iter().map(|s| s.uuid).collect();
            if let Ok(Some(properties)) = handle.properties().await {
                offered.extend(properties.services);
            }
            if !services.is_empty() && !services.iter().any(|s| offered.contains(s)) {
                continue;
            }

            self.shared.peripherals.write().insert(id.clone(), handle);
            connected.push(id);
        }
        connected
    }
}

impl std::fmt::Debug for BtleplugRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugRadio")
            .field("power", &*self.shared.power.read())
            .field("scanning", &self.is_scanning())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_power_from_adapter_state() {
        assert_eq!(power_from(CentralState::PoweredOn), PowerState::PoweredOn);
        assert_eq!(power_from(CentralState::PoweredOff), PowerState::PoweredOff);
        assert_eq!(power_from(CentralState::Unknown), PowerState::Unknown);
    }

    #[test]
    fn test_link_down_reports_once() {
        let id = PeripheralId::parse("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(link_down_event(&id, ConnectionState::Disconnected, None), None);
    }

    #[test]
    fn test_link_down_by_previous_state() {
        let id = PeripheralId::parse("AA:BB:CC:DD:EE:FF").unwrap();

        assert_eq!(
            link_down_event(&id, ConnectionState::Disconnecting, Some(RadioError::ConnectionLost)),
            Some(RadioEvent::Disconnected {
                peripheral: id.clone(),
                error: None,
            })
        );
        assert_eq!(
            link_down_event(
                &id,
                ConnectionState::Connecting,
                Some(RadioError::ConnectionFailed {
                    reason: "timeout".to_string(),
                })
            ),
            Some(RadioEvent::ConnectFailed {
                peripheral: id.clone(),
                error: RadioError::ConnectionFailed {
                    reason: "timeout".to_string(),
                },
            })
        );
        assert_eq!(
            link_down_event(&id, ConnectionState::Connected, None),
            Some(RadioEvent::Disconnected {
                peripheral: id,
                error: Some(RadioError::ConnectionLost),
            })
        );
    }
}
