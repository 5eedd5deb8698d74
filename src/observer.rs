//! Observer registration and event fan-out.
//!
//! Every observer is a set of optional callback slots. The registry keeps
//! observers in registration order and delivers each event to the matching
//! slot of every observer, then mirrors it on a broadcast channel for
//! subscribers that prefer a stream.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, trace};

use crate::ble::peripheral::{DiscoveredPeripheral, GattCharacteristic, PeripheralId};
use crate::error::RadioError;

/// Default capacity of the broadcast mirror.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Called with `true` when the radio becomes usable and `false` otherwise.
pub type PowerCallback = Arc<dyn Fn(bool) + Send + Sync>;
/// Called for every discovered or re-identified peripheral.
pub type DiscoveredCallback = Arc<dyn Fn(&DiscoveredPeripheral) + Send + Sync>;
/// Called with the new connection status and the failure, if any.
pub type ConnectionCallback = Arc<dyn Fn(&PeripheralId, bool, Option<&RadioError>) + Send + Sync>;
/// Called for characteristic values and write completions.
pub type CharacteristicCallback =
    Arc<dyn Fn(&PeripheralId, &GattCharacteristic, Option<&RadioError>) + Send + Sync>;

/// An event delivered to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    /// Radio usability changed.
    PowerChanged {
        /// Whether scan and connect requests are possible.
        usable: bool,
    },
    /// A peripheral was discovered or re-identified.
    Discovered(DiscoveredPeripheral),
    /// A peripheral connected, disconnected or failed to connect.
    ConnectionChanged {
        /// The peripheral.
        peripheral: PeripheralId,
        /// New connection status.
        connected: bool,
        /// Failure that caused the change, if any.
        error: Option<RadioError>,
    },
    /// A characteristic value was read or notified.
    ValueUpdated {
        /// The peripheral.
        peripheral: PeripheralId,
        /// The characteristic and its value.
        characteristic: GattCharacteristic,
        /// Failure of the read, if any.
        error: Option<RadioError>,
    },
    /// A characteristic write completed.
    WriteCompleted {
        /// The peripheral.
        peripheral: PeripheralId,
        /// The characteristic written.
        characteristic: GattCharacteristic,
        /// Failure of the write, if any.
        error: Option<RadioError>,
    },
}

/// A set of optional callbacks.
///
/// # Example
///
/// ```
/// use ble_central_hub::Observer;
///
/// let observer = Observer::new()
///     .on_power_usable(|usable| println!("radio usable: {usable}"))
///     .on_connection_changed(|peripheral, connected, error| {
///         println!("{peripheral}: connected={connected} error={error:?}");
///     });
/// assert!(observer.has_power_slot());
/// ```
#[derive(Clone, Default)]
pub struct Observer {
    power_usable: Option<PowerCallback>,
    discovered: Option<DiscoveredCallback>,
    connection_changed: Option<ConnectionCallback>,
    value_updated: Option<CharacteristicCallback>,
    write_completed: Option<CharacteristicCallback>,
}

impl Observer {
    /// Create an observer with no slots filled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the power slot.
    pub fn on_power_usable<F>(mut self, callback: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.power_usable = Some(Arc::new(callback));
        self
    }

    /// Fill the discovery slot.
    pub fn on_discovered<F>(mut self, callback: F) -> Self
    where
        F: Fn(&DiscoveredPeripheral) + Send + Sync + 'static,
    {
        self.discovered = Some(Arc::new(callback));
        self
    }

    /// Fill the connection slot.
    pub fn on_connection_changed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&PeripheralId, bool, Option<&RadioError>) + Send + Sync + 'static,
    {
        self.connection_changed = Some(Arc::new(callback));
        self
    }

    /// Fill the value slot.
    pub fn on_value_updated<F>(mut self, callback: F) -> Self
    where
        F: Fn(&PeripheralId, &GattCharacteristic, Option<&RadioError>) + Send + Sync + 'static,
    {
        self.value_updated = Some(Arc::new(callback));
        self
    }

    /// Fill the write slot.
    pub fn on_write_completed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&PeripheralId, &GattCharacteristic, Option<&RadioError>) + Send + Sync + 'static,
    {
        self.write_completed = Some(Arc::new(callback));
        self
    }

    /// Check if the power slot is filled.
    pub fn has_power_slot(&self) -> bool {
        self.power_usable.is_some()
    }

    /// Invoke the slot matching `event`. Returns `false` if that slot is empty.
    fn deliver(&self, event: &ObserverEvent) -> bool {
        match event {
            ObserverEvent::PowerChanged { usable } => match &self.power_usable {
                Some(cb) => {
                    cb(*usable);
                    true
                }
                None => false,
            },
            ObserverEvent::Discovered(discovered) => match &self.discovered {
                Some(cb) => {
                    cb(discovered);
                    true
                }
                None => false,
            },
            ObserverEvent::ConnectionChanged {
                peripheral,
                connected,
                error,
            } => match &self.connection_changed {
                Some(cb) => {
                    cb(peripheral, *connected, error.as_ref());
                    true
                }
                None => false,
            },
            ObserverEvent::ValueUpdated {
                peripheral,
                characteristic,
                error,
            } => match &self.value_updated {
                Some(cb) => {
                    cb(peripheral, characteristic, error.as_ref());
                    true
                }
                None => false,
            },
            ObserverEvent::WriteCompleted {
                peripheral,
                characteristic,
                error,
            } => match &self.write_completed {
                Some(cb) => {
                    cb(peripheral, characteristic, error.as_ref());
                    true
                }
                None => false,
            },
        }
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("power_usable", &self.power_usable.is_some())
            .field("discovered", &self.discovered.is_some())
            .field("connection_changed", &self.connection_changed.is_some())
            .field("value_updated", &self.value_updated.is_some())
            .field("write_completed", &self.write_completed.is_some())
            .finish()
    }
}

/// Handle identifying one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl ObserverId {
    /// The raw handle value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

#[derive(Debug)]
struct ObserverEntry {
    identity: Option<String>,
    observer: Observer,
}

/// Observers in registration order.
///
/// Handles are allocated from a counter, so ordering by handle is ordering by
/// registration.
pub struct ObserverRegistry {
    entries: BTreeMap<ObserverId, ObserverEntry>,
    identities: HashMap<String, ObserverId>,
    next_id: u64,
    event_tx: broadcast::Sender<ObserverEvent>,
}

impl ObserverRegistry {
    /// Create an empty registry whose broadcast mirror holds `capacity`
    /// events per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));

        Self {
            entries: BTreeMap::new(),
            identities: HashMap::new(),
            next_id: 0,
            event_tx,
        }
    }

    /// Register an observer under an identity.
    ///
    /// Any earlier registration with the same identity is removed first, so
    /// the new one lands at the end of the delivery order.
    pub fn add(&mut self, identity: impl Into<String>, observer: Observer) -> ObserverId {
        let identity = identity.into();
        self.remove(&identity);

        let id = self.allocate();
        self.identities.insert(identity.clone(), id);
        self.entries.insert(
            id,
            ObserverEntry {
                identity: Some(identity),
                observer,
            },
        );
        id
    }

    /// Register an observer without an identity.
    pub fn register(&mut self, observer: Observer) -> ObserverId {
        let id = self.allocate();
        self.entries.insert(
            id,
            ObserverEntry {
                identity: None,
                observer,
            },
        );
        id
    }

    /// Remove the observer registered under an identity.
    pub fn remove(&mut self, identity: &str) -> bool {
        match self.identities.remove(identity) {
            Some(id) => self.entries.remove(&id).is_some(),
            None => false,
        }
    }

    /// Remove an observer by handle. Stale handles are ignored.
    pub fn remove_by_id(&mut self, id: ObserverId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                if let Some(identity) = entry.identity {
                    self.identities.remove(&identity);
                }
                true
            }
            None => false,
        }
    }

    /// Check if an identity is registered.
    pub fn contains(&self, identity: &str) -> bool {
        self.identities.contains_key(identity)
    }

    /// Handles in delivery order.
    pub fn ids(&self) -> Vec<ObserverId> {
        self.entries.keys().copied().collect()
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscribe to the broadcast mirror.
    pub fn subscribe(&self) -> broadcast::Receiver<ObserverEvent> {
        self.event_tx.subscribe()
    }

    /// A sender for the broadcast mirror, for creating receivers elsewhere.
    pub fn sender(&self) -> broadcast::Sender<ObserverEvent> {
        self.event_tx.clone()
    }

    /// Deliver an event to every observer in registration order.
    ///
    /// A panicking callback is logged and skipped; later observers still
    /// receive the event.
    pub fn notify_all(&self, event: &ObserverEvent) {
        for (id, entry) in &self.entries {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry.observer.deliver(event)));
            match outcome {
                Ok(true) => {}
                Ok(false) => trace!("{} has no slot for {:?}", id, event),
                Err(_) => error!("{} panicked while handling {:?}", id, event),
            }
        }

        // No subscribers is fine.
        let _ = self.event_tx.send(event.clone());
    }

    fn allocate(&mut self) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        id
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.entries.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}
