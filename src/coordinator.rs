//! Connection lifecycle and subscription replay.
//!
//! The [`CentralCoordinator`] sits between a [`RadioCapability`] and the
//! registered observers. It turns caller requests into radio requests, walks
//! each connected peripheral through service and characteristic discovery
//! according to its [`SubscriptionSpec`], and fans every outcome out to the
//! [`ObserverRegistry`].
//!
//! The coordinator is plain data: it does no locking and spawns nothing.
//! [`crate::CentralManager`] runs it on a single task.

use bytes::Bytes;
use std::collections::{BTreeSet, HashSet};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::connection::{ConnectionState, LinkState};
use crate::ble::peripheral::{DiscoveredPeripheral, PeripheralId};
use crate::ble::radio::{ConnectOptions, PowerState, RadioCapability, RadioEvent, ScanOptions};
use crate::config::CoordinatorConfig;
use crate::error::{RadioError, Result};
use crate::observer::{Observer, ObserverEvent, ObserverId, ObserverRegistry};
use crate::registry::{DeviceRegistry, DeviceStore};
use crate::subscription::{SubscriptionSpec, SubscriptionTable, TrackedPeripheral};

/// Central-role state machine over one radio.
pub struct CentralCoordinator<R: RadioCapability> {
    radio: R,
    devices: DeviceRegistry,
    subscriptions: SubscriptionTable,
    observers: ObserverRegistry,
    /// Peripherals whose events are forwarded. Bound on connect, unbound on
    /// cancel, failure or disconnect.
    bound: HashSet<PeripheralId>,
    /// Peripherals we tore down ourselves. The radio's confirmation for
    /// these has already been reported and is swallowed.
    cancelling: HashSet<PeripheralId>,
    config: CoordinatorConfig,
}

impl<R: RadioCapability> CentralCoordinator<R> {
    /// Create a coordinator over `radio`, persisting reacquirable devices in
    /// `store`.
    pub fn new(radio: R, store: impl DeviceStore + 'static, config: CoordinatorConfig) -> Self {
        Self {
            radio,
            devices: DeviceRegistry::new(store),
            subscriptions: SubscriptionTable::new(),
            observers: ObserverRegistry::new(config.event_capacity),
            bound: HashSet::new(),
            cancelling: HashSet::new(),
            config,
        }
    }

    /// The radio.
    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// Tracked peripherals.
    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    /// Registered observers.
    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    /// The configuration in use.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Check if a peripheral's events are being forwarded.
    pub fn is_bound(&self, peripheral: &PeripheralId) -> bool {
        self.bound.contains(peripheral)
    }

    /// Subscribe to the broadcast mirror of observer events.
    pub fn subscribe(&self) -> broadcast::Receiver<ObserverEvent> {
        self.observers.subscribe()
    }

    // ------------------------------------------------------------------
    // Caller operations
    // ------------------------------------------------------------------

    /// Start scanning, then reacquire persisted peripherals if configured.
    ///
    /// Ignored while the radio is unusable or already scanning. Returns
    /// whether the scan was started.
    pub async fn start_scan(&mut self, options: ScanOptions) -> bool {
        let power = self.radio.power_state();
        if !power.is_usable() {
            debug!("Not scanning, radio is {}", power);
            return false;
        }
        if self.radio.is_scanning() {
            debug!("Already scanning");
            return false;
        }

        info!(
            "Starting scan (services: {:?}, duplicates: {})",
            options.services, options.allow_duplicates
        );
        self.radio.start_scan(&options);

        if self.config.reacquire_on_scan {
            self.reacquire().await;
        }
        true
    }

    /// Stop scanning. Does nothing if no scan is active.
    pub fn stop_scan(&mut self) {
        if !self.radio.is_scanning() {
            debug!("Not scanning");
            return;
        }
        info!("Stopping scan");
        self.radio.stop_scan();
    }

    /// Connect to a peripheral and replay `spec` once connected.
    ///
    /// Ignored unless the radio is usable and reports the peripheral
    /// disconnected. Returns whether the request was issued.
    pub fn connect(
        &mut self,
        peripheral: PeripheralId,
        options: ConnectOptions,
        spec: SubscriptionSpec,
    ) -> bool {
        let power = self.radio.power_state();
        if !power.is_usable() {
            debug!("Not connecting to {}, radio is {}", peripheral, power);
            return false;
        }
        let link = self.radio.connection_state(&peripheral);
        if link != ConnectionState::Disconnected {
            debug!("Not connecting to {}, link is {}", peripheral, link);
            return false;
        }

        info!("Connecting to {}", peripheral);
        self.track_connect(peripheral, options, spec);
        true
    }

    /// Tear down a connected peripheral.
    ///
    /// Observers hear `connected = false` immediately; the radio's own
    /// confirmation is not reported again. Ignored unless the radio reports
    /// the peripheral connected. Returns whether the cancel was issued.
    pub fn cancel_connect(&mut self, peripheral: &PeripheralId) -> bool {
        let link = self.radio.connection_state(peripheral);
        if link != ConnectionState::Connected {
            debug!("Not cancelling {}, link is {}", peripheral, link);
            return false;
        }

        info!("Cancelling connection to {}", peripheral);
        self.bound.remove(peripheral);
        self.subscriptions.remove(peripheral);
        self.cancelling.insert(peripheral.clone());
        self.radio.cancel_connect(peripheral);

        self.observers.notify_all(&ObserverEvent::ConnectionChanged {
            peripheral: peripheral.clone(),
            connected: false,
            error: None,
        });
        true
    }

    /// Read, and monitor if it notifies, a characteristic of a connected
    /// peripheral. The value arrives through the value slot.
    pub fn read_value(&mut self, peripheral: &PeripheralId, service: Uuid, characteristic: Uuid) -> bool {
        if !self.bound.contains(peripheral) {
            debug!("Not reading {} from {}, not connected", characteristic, peripheral);
            return false;
        }
        debug!("Reading {} from {}", characteristic, peripheral);
        self.radio.read_value(peripheral, service, characteristic);
        true
    }

    /// Write a characteristic of a connected peripheral. Completion arrives
    /// through the write slot.
    pub fn write_value(
        &mut self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        value: Bytes,
        with_response: bool,
    ) -> bool {
        if !self.bound.contains(peripheral) {
            debug!("Not writing {} on {}, not connected", characteristic, peripheral);
            return false;
        }
        debug!(
            "Writing {} bytes to {} on {}",
            value.len(),
            characteristic,
            peripheral
        );
        self.radio
            .write_value(peripheral, service, characteristic, value, with_response);
        true
    }

    /// Register an observer under an identity, replacing any earlier one.
    pub fn add_observer(&mut self, identity: impl Into<String>, observer: Observer) -> ObserverId {
        let identity = identity.into();
        debug!("Adding observer {:?}", identity);
        self.observers.add(identity, observer)
    }

    /// Register an anonymous observer.
    pub fn register_observer(&mut self, observer: Observer) -> ObserverId {
        self.observers.register(observer)
    }

    /// Remove the observer registered under an identity.
    pub fn remove_observer(&mut self, identity: &str) -> bool {
        debug!("Removing observer {:?}", identity);
        self.observers.remove(identity)
    }

    /// Remove an observer by handle.
    pub fn remove_observer_by_id(&mut self, id: ObserverId) -> bool {
        self.observers.remove_by_id(id)
    }

    /// Persist a peripheral so the next scan reacquires it, even after a
    /// restart.
    pub async fn remember_for_reacquisition(
        &self,
        peripheral: &PeripheralId,
        spec: SubscriptionSpec,
    ) -> Result<()> {
        self.devices.remember(peripheral, spec).await
    }

    /// Stop reacquiring a peripheral.
    pub async fn forget_for_reacquisition(&self, peripheral: &PeripheralId) -> Result<()> {
        self.devices.forget(peripheral).await
    }

    /// Give up on connect requests past their deadline.
    ///
    /// Each is cancelled at the radio, dropped from the table and reported
    /// with [`RadioError::Timeout`]. Returns the peripherals given up on.
    pub fn expire_overdue_connects(&mut self) -> Vec<PeripheralId> {
        let mut overdue = self.subscriptions.overdue(Instant::now());
        overdue.sort();

        for peripheral in &overdue {
            warn!("Connect to {} timed out", peripheral);
            self.subscriptions.remove(peripheral);
            self.bound.remove(peripheral);
            self.cancelling.insert(peripheral.clone());
            self.radio.cancel_connect(peripheral);

            self.observers.notify_all(&ObserverEvent::ConnectionChanged {
                peripheral: peripheral.clone(),
                connected: false,
                error: Some(RadioError::Timeout),
            });
        }
        overdue
    }

    // ------------------------------------------------------------------
    // Radio events
    // ------------------------------------------------------------------

    /// Apply one radio event.
    pub fn handle_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::PowerStateChanged(power) => self.on_power_changed(power.is_usable(), power),
            RadioEvent::StateRestored {
                peripherals,
                scan_services,
            } => {
                info!(
                    "Radio restored {} peripheral(s), scan services {:?}",
                    peripherals.len(),
                    scan_services
                );
            }
            RadioEvent::PeripheralDiscovered(discovered) => {
                trace!("Discovered {} (rssi {:?})", discovered.peripheral, discovered.rssi);
                self.observers
                    .notify_all(&ObserverEvent::Discovered(discovered));
            }
            RadioEvent::Connected(peripheral) => self.on_connected(peripheral),
            RadioEvent::ConnectFailed { peripheral, error } => {
                self.on_link_down(peripheral, Some(error), true)
            }
            RadioEvent::Disconnected { peripheral, error } => {
                self.on_link_down(peripheral, error, false)
            }
            RadioEvent::ServicesDiscovered { peripheral, result } => {
                self.on_services_discovered(peripheral, result)
            }
            RadioEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                result,
            } => self.on_characteristics_discovered(peripheral, service, result),
            RadioEvent::ValueUpdated {
                peripheral,
                characteristic,
                error,
            } => {
                if !self.bound.contains(&peripheral) {
                    trace!("Dropping value from unbound {}", peripheral);
                    return;
                }
                if let Some(e) = &error {
                    warn!("Reading {} from {} failed: {}", characteristic.uuid, peripheral, e);
                }
                self.observers.notify_all(&ObserverEvent::ValueUpdated {
                    peripheral,
                    characteristic,
                    error,
                });
            }
            RadioEvent::WriteCompleted {
                peripheral,
                characteristic,
                error,
            } => {
                if !self.bound.contains(&peripheral) {
                    trace!("Dropping write completion from unbound {}", peripheral);
                    return;
                }
                if let Some(e) = &error {
                    warn!("Writing {} on {} failed: {}", characteristic.uuid, peripheral, e);
                }
                self.observers.notify_all(&ObserverEvent::WriteCompleted {
                    peripheral,
                    characteristic,
                    error,
                });
            }
        }
    }

    fn on_power_changed(&mut self, usable: bool, power: PowerState) {
        info!("Radio is {} (usable: {})", power, usable);
        self.observers
            .notify_all(&ObserverEvent::PowerChanged { usable });

        if !usable && !self.subscriptions.is_empty() {
            debug!(
                "Dropping {} tracked peripheral(s) after power loss",
                self.subscriptions.len()
            );
            self.subscriptions.clear();
        }
    }

    fn on_connected(&mut self, peripheral: PeripheralId) {
        if self.cancelling.contains(&peripheral) {
            debug!("Ignoring late connect of cancelled {}", peripheral);
            return;
        }

        info!("Connected to {}", peripheral);
        self.bound.insert(peripheral.clone());
        self.observers.notify_all(&ObserverEvent::ConnectionChanged {
            peripheral: peripheral.clone(),
            connected: true,
            error: None,
        });

        self.radio.discover_services(&peripheral);
        match self.subscriptions.get_mut(&peripheral) {
            Some(tracked) => {
                tracked.mark_connected();
                tracked.begin_service_discovery();
            }
            None => debug!("{} connected without tracked subscriptions", peripheral),
        }
    }

    fn on_link_down(&mut self, peripheral: PeripheralId, error: Option<RadioError>, failed: bool) {
        self.bound.remove(&peripheral);
        self.subscriptions.remove(&peripheral);

        if self.cancelling.remove(&peripheral) {
            debug!("Teardown of {} confirmed", peripheral);
            return;
        }

        match (&error, failed) {
            (Some(e), true) => warn!("Failed to connect to {}: {}", peripheral, e),
            (Some(e), false) => warn!("Lost {}: {}", peripheral, e),
            (None, _) => info!("Disconnected from {}", peripheral),
        }
        self.observers.notify_all(&ObserverEvent::ConnectionChanged {
            peripheral,
            connected: false,
            error,
        });
    }

    fn on_services_discovered(
        &mut self,
        peripheral: PeripheralId,
        result: std::result::Result<Vec<Uuid>, RadioError>,
    ) {
        if !self.bound.contains(&peripheral) {
            trace!("Dropping services of unbound {}", peripheral);
            return;
        }
        let services = match result {
            Ok(services) => services,
            Err(e) => {
                warn!("Service discovery on {} failed: {}", peripheral, e);
                return;
            }
        };
        let Some(tracked) = self.subscriptions.get_mut(&peripheral) else {
            debug!("No subscriptions for {}", peripheral);
            return;
        };
        if tracked.state != LinkState::DiscoveringServices {
            debug!("Ignoring services of {} while {}", peripheral, tracked.state);
            return;
        }

        let matched: BTreeSet<Uuid> = services
            .into_iter()
            .filter(|service| tracked.spec.contains_service(service))
            .collect();
        debug!("{} offers {} wanted service(s)", peripheral, matched.len());

        for service in &matched {
            self.radio.discover_characteristics(&peripheral, *service);
        }
        tracked.begin_characteristic_discovery(matched);
        if tracked.state == LinkState::Subscribed {
            info!("{} subscribed (no wanted services)", peripheral);
        }
    }

    fn on_characteristics_discovered(
        &mut self,
        peripheral: PeripheralId,
        service: Uuid,
        result: std::result::Result<Vec<Uuid>, RadioError>,
    ) {
        if !self.bound.contains(&peripheral) {
            trace!("Dropping characteristics of unbound {}", peripheral);
            return;
        }
        let Some(tracked) = self.subscriptions.get_mut(&peripheral) else {
            debug!("No subscriptions for {}", peripheral);
            return;
        };
        if !tracked.state.is_pending(&service) {
            debug!(
                "Ignoring characteristics of {} on {} while {}",
                service, peripheral, tracked.state
            );
            return;
        }

        match result {
            Ok(characteristics) => {
                for characteristic in characteristics
                    .into_iter()
                    .filter(|c| tracked.spec.wants(&service, c))
                {
                    debug!("Subscribing to {} on {}", characteristic, peripheral);
                    self.radio.read_value(&peripheral, service, characteristic);
                }
            }
            Err(e) => warn!(
                "Characteristic discovery of {} on {} failed: {}",
                service, peripheral, e
            ),
        }

        tracked.finish_service(&service);
        if tracked.state == LinkState::Subscribed {
            info!("{} subscribed", peripheral);
        }
    }

    // ------------------------------------------------------------------
    // Reacquisition
    // ------------------------------------------------------------------

    /// Re-identify persisted peripherals and reconnect the ones the platform
    /// already holds a link to.
    async fn reacquire(&mut self) {
        let persisted = self.devices.load().await;
        if persisted.is_empty() {
            return;
        }

        let ids: Vec<PeripheralId> = persisted.keys().cloned().collect();
        for retrieved in self.radio.retrieve_peripherals(&ids).await {
            debug!("Reacquired {}", retrieved.peripheral);
            self.observers
                .notify_all(&ObserverEvent::Discovered(DiscoveredPeripheral {
                    peripheral: retrieved.peripheral,
                    advertisement: None,
                    rssi: retrieved.rssi,
                }));
        }

        let services: Vec<Uuid> = persisted
            .values()
            .flat_map(|spec| spec.services().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if services.is_empty() {
            return;
        }

        for peripheral in self.radio.retrieve_connected_peripherals(&services).await {
            let Some(spec) = persisted.get(&peripheral) else {
                trace!("{} is connected but not remembered", peripheral);
                continue;
            };
            if self.subscriptions.contains(&peripheral) {
                debug!("{} is already tracked", peripheral);
                continue;
            }
            info!("Reconnecting remembered {}", peripheral);
            self.track_connect(peripheral, ConnectOptions::default(), spec.clone());
        }
    }

    fn track_connect(&mut self, peripheral: PeripheralId, options: ConnectOptions, spec: SubscriptionSpec) {
        let deadline = self.config.connect_timeout.map(|timeout| Instant::now() + timeout);
        self.cancelling.remove(&peripheral);
        self.subscriptions
            .insert(peripheral.clone(), TrackedPeripheral::connecting(spec, deadline));
        self.radio.connect(&peripheral, options);
    }
}

impl<R: RadioCapability> std::fmt::Debug for CentralCoordinator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralCoordinator")
            .field("subscriptions", &self.subscriptions.len())
            .field("observers", &self.observers.len())
            .field("bound", &self.bound.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
