//! Desired subscriptions per peripheral.
//!
//! A [`SubscriptionSpec`] names the services to discover on a peripheral and,
//! within each, the characteristics to read and monitor. The
//! [`SubscriptionTable`] holds the spec of every peripheral with an
//! outstanding or established connection, together with its [`LinkState`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::time::Instant;
use uuid::Uuid;

use crate::ble::connection::LinkState;
use crate::ble::peripheral::PeripheralId;
use crate::ble::uuids::parse_uuid;
use crate::error::Result;

/// Services to discover and, within them, characteristics to monitor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionSpec(BTreeMap<Uuid, BTreeSet<Uuid>>);

impl SubscriptionSpec {
    /// Create an empty spec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service and characteristics to monitor within it.
    ///
    /// Adding a service twice merges the characteristic sets.
    pub fn with_service(
        mut self,
        service: Uuid,
        characteristics: impl IntoIterator<Item = Uuid>,
    ) -> Self {
        self.0.entry(service).or_default().extend(characteristics);
        self
    }

    /// Build a spec from UUID strings.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidUuid`] for the first string that does
    /// not parse.
    pub fn parse<'a, I, C>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, C)>,
        C: IntoIterator<Item = &'a str>,
    {
        let mut spec = Self::new();
        for (service, characteristics) in entries {
            let service = parse_uuid(service)?;
            let characteristics = characteristics
                .into_iter()
                .map(parse_uuid)
                .collect::<Result<Vec<_>>>()?;
            spec = spec.with_service(service, characteristics);
        }
        Ok(spec)
    }

    /// Check if a service is wanted.
    pub fn contains_service(&self, service: &Uuid) -> bool {
        self.0.contains_key(service)
    }

    /// Characteristics wanted within a service.
    pub fn characteristics(&self, service: &Uuid) -> Option<&BTreeSet<Uuid>> {
        self.0.get(service)
    }

    /// Check if a characteristic of a service is wanted.
    pub fn wants(&self, service: &Uuid, characteristic: &Uuid) -> bool {
        self.0
            .get(service)
            .map(|chars| chars.contains(characteristic))
            .unwrap_or(false)
    }

    /// Wanted services.
    pub fn services(&self) -> impl Iterator<Item = &Uuid> {
        self.0.keys()
    }

    /// Check if nothing is wanted.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of wanted services.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// A peripheral with an outstanding or established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedPeripheral {
    /// What to subscribe to once connected.
    pub spec: SubscriptionSpec,
    /// How far the peripheral has progressed.
    pub state: LinkState,
    /// When an unanswered connect request gives up.
    pub connect_deadline: Option<Instant>,
}

impl TrackedPeripheral {
    /// A peripheral whose connect request was just issued.
    pub fn connecting(spec: SubscriptionSpec, connect_deadline: Option<Instant>) -> Self {
        Self {
            spec,
            state: LinkState::Connecting,
            connect_deadline,
        }
    }

    /// Record that the link is up.
    pub fn mark_connected(&mut self) {
        self.state = LinkState::Connected;
        self.connect_deadline = None;
    }

    /// Record that service discovery was requested.
    pub fn begin_service_discovery(&mut self) {
        self.state = LinkState::DiscoveringServices;
    }

    /// Record the services whose characteristics were requested.
    ///
    /// With nothing pending the peripheral is immediately subscribed.
    pub fn begin_characteristic_discovery(&mut self, pending: BTreeSet<Uuid>) {
        self.state = if pending.is_empty() {
            LinkState::Subscribed
        } else {
            LinkState::DiscoveringCharacteristics { pending }
        };
    }

    /// Record that a service's characteristic discovery finished, either way.
    ///
    /// Returns `false` if the service was not pending.
    pub fn finish_service(&mut self, service: &Uuid) -> bool {
        let LinkState::DiscoveringCharacteristics { pending } = &mut self.state else {
            return false;
        };
        if !pending.remove(service) {
            return false;
        }
        if pending.is_empty() {
            self.state = LinkState::Subscribed;
        }
        true
    }

    /// Check if the connect deadline has passed.
    pub fn is_overdue(&self, now: Instant) -> bool {
        matches!(self.state, LinkState::Connecting)
            && self.connect_deadline.map(|d| now >= d).unwrap_or(false)
    }
}

/// Subscriptions of every tracked peripheral for this process lifetime.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionTable {
    entries: HashMap<PeripheralId, TrackedPeripheral>,
}

impl SubscriptionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a peripheral, replacing any previous entry.
    pub fn insert(&mut self, peripheral: PeripheralId, tracked: TrackedPeripheral) {
        self.entries.insert(peripheral, tracked);
    }

    /// Look up a tracked peripheral.
    pub fn get(&self, peripheral: &PeripheralId) -> Option<&TrackedPeripheral> {
        self.entries.get(peripheral)
    }

    /// Look up a tracked peripheral for update.
    pub fn get_mut(&mut self, peripheral: &PeripheralId) -> Option<&mut TrackedPeripheral> {
        self.entries.get_mut(peripheral)
    }

    /// Stop tracking a peripheral.
    pub fn remove(&mut self, peripheral: &PeripheralId) -> Option<TrackedPeripheral> {
        self.entries.remove(peripheral)
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Check if a peripheral is tracked.
    pub fn contains(&self, peripheral: &PeripheralId) -> bool {
        self.entries.contains_key(peripheral)
    }

    /// Number of tracked peripherals.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over tracked peripherals.
    pub fn iter(&self) -> impl Iterator<Item = (&PeripheralId, &TrackedPeripheral)> {
        self.entries.iter()
    }

    /// Peripherals whose connect deadline has passed.
    pub fn overdue(&self, now: Instant) -> Vec<PeripheralId> {
        self.entries
            .iter()
            .filter(|(_, tracked)| tracked.is_overdue(now))
            .map(|(id, _)| id.clone())
            .collect()
    }
}
