//! In-process radio.
//!
//! [`SimulatedRadio`] records every request instead of touching hardware and
//! lets the caller play the radio's part by emitting [`RadioEvent`]s. Used
//! for integration testing and for running the hub without an adapter.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::ble::connection::ConnectionState;
use crate::ble::peripheral::PeripheralId;
use crate::ble::radio::{
    ConnectOptions, PowerState, RadioCapability, RadioEvent, RadioEventSender, RadioEvents,
    RetrievedPeripheral, ScanOptions,
};

/// A request the simulated radio received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioRequest {
    /// `start_scan`
    StartScan(ScanOptions),
    /// `stop_scan`
    StopScan,
    /// `connect`
    Connect {
        /// The peripheral.
        peripheral: PeripheralId,
        /// Alert preferences.
        options: ConnectOptions,
    },
    /// `cancel_connect`
    CancelConnect(PeripheralId),
    /// `discover_services`
    DiscoverServices(PeripheralId),
    /// `discover_characteristics`
    DiscoverCharacteristics {
        /// The peripheral.
        peripheral: PeripheralId,
        /// The service searched.
        service: Uuid,
    },
    /// `read_value`
    ReadValue {
        /// The peripheral.
        peripheral: PeripheralId,
        /// The service.
        service: Uuid,
        /// The characteristic.
        characteristic: Uuid,
    },
    /// `write_value`
    WriteValue {
        /// The peripheral.
        peripheral: PeripheralId,
        /// The service.
        service: Uuid,
        /// The characteristic.
        characteristic: Uuid,
        /// Bytes written.
        value: Bytes,
        /// Whether a response was requested.
        with_response: bool,
    },
}

#[derive(Debug, Default)]
struct SimState {
    power: PowerState,
    scanning: bool,
    links: HashMap<PeripheralId, ConnectionState>,
    requests: Vec<RadioRequest>,
    known: BTreeMap<PeripheralId, Option<i16>>,
    system_connected: BTreeMap<PeripheralId, Vec<Uuid>>,
}

/// A radio driven by the caller.
///
/// Clones share state, so a test can keep one clone while the hub owns
/// another.
#[derive(Debug, Clone)]
pub struct SimulatedRadio {
    state: Arc<Mutex<SimState>>,
    events_tx: RadioEventSender,
}

impl SimulatedRadio {
    /// Create a radio in the given power state, along with its event stream.
    pub fn new(power: PowerState) -> (Self, RadioEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let radio = Self {
            state: Arc::new(Mutex::new(SimState {
                power,
                ..SimState::default()
            })),
            events_tx,
        };
        (radio, events_rx)
    }

    /// Play the radio: apply the event's effect on simulated link and power
    /// state, then deliver it.
    pub fn emit(&self, event: RadioEvent) {
        {
            let mut state = self.state.lock();
            match &event {
                RadioEvent::PowerStateChanged(power) => {
                    state.power = *power;
                    if !power.is_usable() {
                        state.scanning = false;
                    }
                }
                RadioEvent::Connected(peripheral) => {
                    state
                        .links
                        .insert(peripheral.clone(), ConnectionState::Connected);
                }
                RadioEvent::ConnectFailed { peripheral, .. }
                | RadioEvent::Disconnected { peripheral, .. } => {
                    state
                        .links
                        .insert(peripheral.clone(), ConnectionState::Disconnected);
                }
                _ => {}
            }
        }

        trace!("Simulated radio emitting {:?}", event);
        // The hub may already be gone.
        let _ = self.events_tx.send(event);
    }

    /// Change the power state and report it.
    pub fn set_power(&self, power: PowerState) {
        self.emit(RadioEvent::PowerStateChanged(power));
    }

    /// Force a link state without emitting anything.
    pub fn set_connection_state(&self, peripheral: &PeripheralId, state: ConnectionState) {
        self.state.lock().links.insert(peripheral.clone(), state);
    }

    /// Make a peripheral retrievable by identifier.
    pub fn add_known_peripheral(&self, peripheral: &PeripheralId, rssi: Option<i16>) {
        self.state.lock().known.insert(peripheral.clone(), rssi);
    }

    /// Pretend the platform already holds a connection to a peripheral
    /// offering `services`.
    pub fn add_system_connection(&self, peripheral: &PeripheralId, services: Vec<Uuid>) {
        let mut state = self.state.lock();
        state.known.entry(peripheral.clone()).or_insert(None);
        state.system_connected.insert(peripheral.clone(), services);
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<RadioRequest> {
        self.state.lock().requests.clone()
    }

    /// Every request received since the last call.
    pub fn take_requests(&self) -> Vec<RadioRequest> {
        std::mem::take(&mut self.state.lock().requests)
    }

    fn record(&self, request: RadioRequest) {
        trace!("Simulated radio received {:?}", request);
        self.state.lock().requests.push(request);
    }
}

#[async_trait]
impl RadioCapability for SimulatedRadio {
    fn power_state(&self) -> PowerState {
        self.state.lock().power
    }

    fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }

    fn connection_state(&self, peripheral: &PeripheralId) -> ConnectionState {
        self.state
            .lock()
            .links
            .get(peripheral)
            .copied()
            .unwrap_or_default()
    }

    fn start_scan(&self, options: &ScanOptions) {
        self.state.lock().scanning = true;
        self.record(RadioRequest::StartScan(options.clone()));
    }

    fn stop_scan(&self) {
        self.state.lock().scanning = false;
        self.record(RadioRequest::StopScan);
    }

    fn connect(&self, peripheral: &PeripheralId, options: ConnectOptions) {
        self.state
            .lock()
            .links
            .insert(peripheral.clone(), ConnectionState::Connecting);
        self.record(RadioRequest::Connect {
            peripheral: peripheral.clone(),
            options,
        });
    }

    fn cancel_connect(&self, peripheral: &PeripheralId) {
        {
            let mut state = self.state.lock();
            if let Some(link) = state.links.get_mut(peripheral) {
                if *link != ConnectionState::Disconnected {
                    *link = ConnectionState::Disconnecting;
                }
            }
        }
        self.record(RadioRequest::CancelConnect(peripheral.clone()));
    }

    fn discover_services(&self, peripheral: &PeripheralId) {
        self.record(RadioRequest::DiscoverServices(peripheral.clone()));
    }

    fn discover_characteristics(&self, peripheral: &PeripheralId, service: Uuid) {
        self.record(RadioRequest::DiscoverCharacteristics {
            peripheral: peripheral.clone(),
            service,
        });
    }

    fn read_value(&self, peripheral: &PeripheralId, service: Uuid, characteristic: Uuid) {
        self.record(RadioRequest::ReadValue {
            peripheral: peripheral.clone(),
            service,
            characteristic,
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
        self.record(RadioRequest::WriteValue {
            peripheral: peripheral.clone(),
            service,
            characteristic,
            value,
            with_response,
        });
    }

    async fn retrieve_peripherals(&self, peripherals: &[PeripheralId]) -> Vec<RetrievedPeripheral> {
        let state = self.state.lock();
        peripherals
            .iter()
            .filter_map(|id| {
                state.known.get(id).map(|rssi| RetrievedPeripheral {
                    peripheral: id.clone(),
                    rssi: *rssi,
                })
            })
            .collect()
    }

    async fn retrieve_connected_peripherals(&self, services: &[Uuid]) -> Vec<PeripheralId> {
        let state = self.state.lock();
        state
            .system_connected
            .iter()
            .filter(|(_, offered)| services.is_empty() || services.iter().any(|s| offered.contains(s)))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{BATTERY_SERVICE_UUID, HEART_RATE_SERVICE_UUID};
    use pretty_assertions::assert_eq;

    fn peripheral(id: &str) -> PeripheralId {
        PeripheralId::parse(id).unwrap()
    }

    #[test]
    fn test_requests_are_recorded_in_order() {
        let (radio, _events) = SimulatedRadio::new(PowerState::PoweredOn);
        radio.start_scan(&ScanOptions::default());
        radio.discover_services(&peripheral("P1"));
        radio.stop_scan();

        assert_eq!(
            radio.take_requests(),
            vec![
                RadioRequest::StartScan(ScanOptions::default()),
                RadioRequest::DiscoverServices(peripheral("P1")),
                RadioRequest::StopScan,
            ]
        );
        assert!(radio.requests().is_empty());
    }

    #[test]
    fn test_emit_tracks_links_and_power() {
        let (radio, mut events) = SimulatedRadio::new(PowerState::PoweredOn);
        let p1 = peripheral("P1");

        radio.connect(&p1, ConnectOptions::default());
        assert_eq!(radio.connection_state(&p1), ConnectionState::Connecting);

        radio.emit(RadioEvent::Connected(p1.clone()));
        assert_eq!(radio.connection_state(&p1), ConnectionState::Connected);
        assert_eq!(events.try_recv().unwrap(), RadioEvent::Connected(p1.clone()));

        radio.start_scan(&ScanOptions::default());
        radio.set_power(PowerState::PoweredOff);
        assert!(!radio.is_scanning());
        assert_eq!(radio.power_state(), PowerState::PoweredOff);
    }

    #[tokio::test]
    async fn test_retrieval() {
        let (radio, _events) = SimulatedRadio::new(PowerState::PoweredOn);
        radio.add_known_peripheral(&peripheral("P1"), Some(-60));
        radio.add_system_connection(&peripheral("P2"), vec![HEART_RATE_SERVICE_UUID]);

        let retrieved = radio
            .retrieve_peripherals(&[peripheral("P1"), peripheral("P3")])
            .await;
        assert_eq!(
            retrieved,
            vec![RetrievedPeripheral {
                peripheral: peripheral("P1"),
                rssi: Some(-60),
            }]
        );

        assert_eq!(
            radio
                .retrieve_connected_peripherals(&[HEART_RATE_SERVICE_UUID])
                .await,
            vec![peripheral("P2")]
        );
        assert!(radio
            .retrieve_connected_peripherals(&[BATTERY_SERVICE_UUID])
            .await
            .is_empty());
        assert_eq!(
            radio.retrieve_connected_peripherals(&[]).await,
            vec![peripheral("P2")]
        );
    }
}
