//! Serial execution context for a [`CentralCoordinator`].
//!
//! The [`CentralManager`] owns a coordinator on a background task. Radio
//! events and caller commands are processed one at a time, in arrival order,
//! on that task; caller methods hand over a command and wait for its
//! acknowledgement, never for the radio.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::peripheral::PeripheralId;
use crate::ble::radio::{ConnectOptions, RadioCapability, RadioEvents, ScanOptions};
use crate::config::CoordinatorConfig;
use crate::coordinator::CentralCoordinator;
use crate::error::{Error, Result};
use crate::observer::{Observer, ObserverEvent, ObserverId};
use crate::registry::DeviceStore;
use crate::subscription::{SubscriptionSpec, TrackedPeripheral};

enum Command {
    StartScan(ScanOptions, oneshot::Sender<bool>),
    StopScan(oneshot::Sender<()>),
    Connect {
        peripheral: PeripheralId,
        options: ConnectOptions,
        spec: SubscriptionSpec,
        reply: oneshot::Sender<bool>,
    },
    CancelConnect(PeripheralId, oneshot::Sender<bool>),
    ReadValue {
        peripheral: PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        reply: oneshot::Sender<bool>,
    },
    WriteValue {
        peripheral: PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        value: Bytes,
        with_response: bool,
        reply: oneshot::Sender<bool>,
    },
    AddObserver(String, Observer, oneshot::Sender<ObserverId>),
    RegisterObserver(Observer, oneshot::Sender<ObserverId>),
    RemoveObserver(String, oneshot::Sender<bool>),
    // Sent from `ObserverHandle::drop`, which cannot wait for a reply.
    RemoveObserverById(ObserverId),
    Remember(PeripheralId, SubscriptionSpec, oneshot::Sender<Result<()>>),
    Forget(PeripheralId, oneshot::Sender<Result<()>>),
    TrackedPeripherals(oneshot::Sender<Vec<(PeripheralId, TrackedPeripheral)>>),
    Shutdown(oneshot::Sender<()>),
}

/// Registration of an observer with a [`CentralManager`].
///
/// Dropping the handle unregisters the observer. Use [`ObserverHandle::detach`]
/// to keep it registered for the manager's lifetime.
#[must_use = "dropping the handle unregisters the observer"]
pub struct ObserverHandle {
    id: ObserverId,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl ObserverHandle {
    fn new(id: ObserverId, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            id,
            commands: Some(commands),
        }
    }

    /// The registration handle.
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Unregister the observer now.
    pub fn unregister(mut self) {
        self.release();
    }

    /// Keep the observer registered and give up the handle.
    pub fn detach(mut self) -> ObserverId {
        self.commands = None;
        self.id
    }

    fn release(&mut self) {
        if let Some(commands) = self.commands.take() {
            // The manager may already be gone, taking the observer with it.
            let _ = commands.send(Command::RemoveObserverById(self.id));
        }
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("id", &self.id)
            .field("attached", &self.commands.is_some())
            .finish()
    }
}

/// Handle to a coordinator running on a background task.
pub struct CentralManager {
    /// Command channel into the background task.
    commands: mpsc::UnboundedSender<Command>,
    /// Broadcast mirror of observer events.
    event_tx: broadcast::Sender<ObserverEvent>,
    /// Background task handle.
    background_handle: Mutex<Option<JoinHandle<()>>>,
    /// Running flag.
    is_running: Arc<AtomicBool>,
}

impl CentralManager {
    /// Start a coordinator over `radio` on a new task.
    ///
    /// `radio_events` must be the event stream created with `radio`. Must be
    /// called from within a tokio runtime.
    pub fn spawn<R>(
        radio: R,
        radio_events: RadioEvents,
        store: impl DeviceStore + 'static,
        config: CoordinatorConfig,
    ) -> Self
    where
        R: RadioCapability + 'static,
    {
        let coordinator = CentralCoordinator::new(radio, store, config);
        let event_tx = coordinator.observers().sender();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let is_running = Arc::new(AtomicBool::new(true));

        info!("Starting central manager");
        let handle = tokio::spawn(run(coordinator, command_rx, radio_events, is_running.clone()));

        Self {
            commands,
            event_tx,
            background_handle: Mutex::new(Some(handle)),
            is_running,
        }
    }

    /// Start scanning and reacquire remembered peripherals.
    ///
    /// Returns `false` if the radio is unusable or already scanning.
    pub async fn start_scan(&self, options: ScanOptions) -> Result<bool> {
        self.request(|reply| Command::StartScan(options, reply)).await
    }

    /// Stop scanning.
    pub async fn stop_scan(&self) -> Result<()> {
        self.request(Command::StopScan).await
    }

    /// Connect to a peripheral and subscribe to `spec` once connected.
    ///
    /// Returns `false` if the radio is unusable or the peripheral is not
    /// disconnected. The outcome arrives through the connection slot.
    pub async fn connect(
        &self,
        peripheral: PeripheralId,
        options: ConnectOptions,
        spec: SubscriptionSpec,
    ) -> Result<bool> {
        self.request(|reply| Command::Connect {
            peripheral,
            options,
            spec,
            reply,
        })
        .await
    }

    /// Tear down a connected peripheral. Observers are told before this
    /// returns.
    pub async fn cancel_connect(&self, peripheral: &PeripheralId) -> Result<bool> {
        let peripheral = peripheral.clone();
        self.request(|reply| Command::CancelConnect(peripheral, reply))
            .await
    }

    /// Read a characteristic of a connected peripheral.
    pub async fn read_value(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<bool> {
        let peripheral = peripheral.clone();
        self.request(|reply| Command::ReadValue {
            peripheral,
            service,
            characteristic,
            reply,
        })
        .await
    }

    /// Write a characteristic of a connected peripheral.
    pub async fn write_value(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Bytes>,
        with_response: bool,
    ) -> Result<bool> {
        let peripheral = peripheral.clone();
        let value = value.into();
        self.request(|reply| Command::WriteValue {
            peripheral,
            service,
            characteristic,
            value,
            with_response,
            reply,
        })
        .await
    }

    /// Register an observer under an identity, replacing any earlier
    /// registration with that identity.
    pub async fn add_observer(
        &self,
        identity: impl Into<String>,
        observer: Observer,
    ) -> Result<ObserverHandle> {
        let identity = identity.into();
        let id = self
            .request(|reply| Command::AddObserver(identity, observer, reply))
            .await?;
        Ok(ObserverHandle::new(id, self.commands.clone()))
    }

    /// Register an anonymous observer.
    pub async fn register_observer(&self, observer: Observer) -> Result<ObserverHandle> {
        let id = self
            .request(|reply| Command::RegisterObserver(observer, reply))
            .await?;
        Ok(ObserverHandle::new(id, self.commands.clone()))
    }

    /// Unregister the observer with an identity.
    pub async fn remove_observer(&self, identity: &str) -> Result<bool> {
        let identity = identity.to_string();
        self.request(|reply| Command::RemoveObserver(identity, reply))
            .await
    }

    /// Persist a peripheral for reacquisition on later scans.
    pub async fn remember_for_reacquisition(
        &self,
        peripheral: &PeripheralId,
        spec: SubscriptionSpec,
    ) -> Result<()> {
        let peripheral = peripheral.clone();
        self.request(|reply| Command::Remember(peripheral, spec, reply))
            .await?
    }

    /// Stop reacquiring a peripheral.
    pub async fn forget_for_reacquisition(&self, peripheral: &PeripheralId) -> Result<()> {
        let peripheral = peripheral.clone();
        self.request(|reply| Command::Forget(peripheral, reply))
            .await?
    }

    /// Snapshot of tracked peripherals, ordered by identifier.
    pub async fn tracked_peripherals(&self) -> Result<Vec<(PeripheralId, TrackedPeripheral)>> {
        self.request(Command::TrackedPeripherals).await
    }

    /// Subscribe to every event delivered to observers.
    pub fn subscribe(&self) -> broadcast::Receiver<ObserverEvent> {
        self.event_tx.subscribe()
    }

    /// Check if the background task is running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop scanning and end the background task.
    ///
    /// Established links are left to the radio. Calling this twice is fine.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        info!("Shutting down central manager");
        self.request(Command::Shutdown).await?;

        let handle = self.background_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| Error::ManagerShutdown)?;
        rx.await.map_err(|_| Error::ManagerShutdown)
    }
}

impl Drop for CentralManager {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.background_handle.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for CentralManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralManager")
            .field("is_running", &self.is_running())
            .finish_non_exhaustive()
    }
}

async fn run<R: RadioCapability>(
    mut coordinator: CentralCoordinator<R>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut radio_events: RadioEvents,
    is_running: Arc<AtomicBool>,
) {
    // Cleared on every exit, unwinding included.
    let _running = RunningGuard(is_running);

    let mut ticker = coordinator.config().connect_timeout.map(|_| {
        let mut ticker =
            tokio::time::interval(coordinator.config().effective_timeout_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut radio_open = true;

    loop {
        // Radio events first, so a command sees every event queued before it.
        tokio::select! {
            biased;

            event = radio_events.recv(), if radio_open => match event {
                Some(event) => coordinator.handle_event(event),
                None => {
                    warn!("Radio event stream closed");
                    radio_open = false;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Shutdown(reply)) => {
                    coordinator.stop_scan();
                    let _ = reply.send(());
                    break;
                }
                Some(command) => handle_command(&mut coordinator, command).await,
                None => break,
            },
            _ = tick(&mut ticker) => {
                coordinator.expire_overdue_connects();
            }
        }
    }

    debug!("Central manager background task ended");
}

struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn handle_command<R: RadioCapability>(coordinator: &mut CentralCoordinator<R>, command: Command) {
    // Callers that stopped waiting are not an error.
    match command {
        Command::StartScan(options, reply) => {
            let _ = reply.send(coordinator.start_scan(options).await);
        }
        Command::StopScan(reply) => {
            coordinator.stop_scan();
            let _ = reply.send(());
        }
        Command::Connect {
            peripheral,
            options,
            spec,
            reply,
        } => {
            let _ = reply.send(coordinator.connect(peripheral, options, spec));
        }
        Command::CancelConnect(peripheral, reply) => {
            let _ = reply.send(coordinator.cancel_connect(&peripheral));
        }
        Command::ReadValue {
            peripheral,
            service,
            characteristic,
            reply,
        } => {
            let _ = reply.send(coordinator.read_value(&peripheral, service, characteristic));
        }
        Command::WriteValue {
            peripheral,
            service,
            characteristic,
            value,
            with_response,
            reply,
        } => {
            let accepted =
                coordinator.write_value(&peripheral, service, characteristic, value, with_response);
            let _ = reply.send(accepted);
        }
        Command::AddObserver(identity, observer, reply) => {
            let _ = reply.send(coordinator.add_observer(identity, observer));
        }
        Command::RegisterObserver(observer, reply) => {
            let _ = reply.send(coordinator.register_observer(observer));
        }
        Command::RemoveObserver(identity, reply) => {
            let _ = reply.send(coordinator.remove_observer(&identity));
        }
        Command::RemoveObserverById(id) => {
            coordinator.remove_observer_by_id(id);
        }
        Command::Remember(peripheral, spec, reply) => {
            let _ = reply.send(coordinator.remember_for_reacquisition(&peripheral, spec).await);
        }
        Command::Forget(peripheral, reply) => {
            let _ = reply.send(coordinator.forget_for_reacquisition(&peripheral).await);
        }
        Command::TrackedPeripherals(reply) => {
            let mut tracked: Vec<_> = coordinator
                .subscriptions()
                .iter()
                .map(|(id, tracked)| (id.clone(), tracked.clone()))
                .collect();
            tracked.sort_by(|a, b| a.0.cmp(&b.0));
            let _ = reply.send(tracked);
        }
        // Handled by the loop.
        Command::Shutdown(reply) => {
            let _ = reply.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::radio::PowerState;
    use crate::ble::simulated::SimulatedRadio;
    use crate::registry::MemoryDeviceStore;
    use std::time::Duration;

    fn manager() -> (CentralManager, SimulatedRadio) {
        let (radio, events) = SimulatedRadio::new(PowerState::PoweredOn);
        let manager = CentralManager::spawn(
            radio.clone(),
            events,
            MemoryDeviceStore::new(),
            CoordinatorConfig::default(),
        );
        (manager, radio)
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (manager, _radio) = manager();
        assert!(manager.is_running());

        manager.shutdown().await.unwrap();
        assert!(!manager.is_running());
        manager.shutdown().await.unwrap();

        assert!(matches!(
            manager.start_scan(ScanOptions::default()).await,
            Err(Error::ManagerShutdown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_scan() {
        let (manager, radio) = manager();
        assert!(manager.start_scan(ScanOptions::default()).await.unwrap());
        assert!(radio.is_scanning());

        manager.shutdown().await.unwrap();
        assert!(!radio.is_scanning());
    }

    #[tokio::test]
    async fn test_dropping_handle_unregisters() {
        let (manager, _radio) = manager();

        let handle = manager.add_observer("ui", Observer::new()).await.unwrap();
        drop(handle);
        // Processed in order, so the removal has happened.
        assert!(!manager.remove_observer("ui").await.unwrap());

        let handle = manager.add_observer("ui", Observer::new()).await.unwrap();
        let _ = handle.detach();
        assert!(manager.remove_observer("ui").await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_check_interval_keeps_running() {
        let (radio, events) = SimulatedRadio::new(PowerState::PoweredOn);
        let config = CoordinatorConfig {
            timeout_check_interval: Duration::ZERO,
            ..CoordinatorConfig::default().with_connect_timeout(Duration::from_secs(5))
        };
        let manager = CentralManager::spawn(radio, events, MemoryDeviceStore::new(), config);

        assert!(manager.start_scan(ScanOptions::default()).await.unwrap());
        assert!(manager.is_running());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_running_flag_cleared_when_task_panics() {
        let flag = Arc::new(AtomicBool::new(true));
        let guard = RunningGuard(flag.clone());

        let task = tokio::spawn(async move {
            let _guard = guard;
            panic!("loop failed");
        });

        assert!(task.await.unwrap_err().is_panic());
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stale_handle_keeps_replacement() {
        let (manager, _radio) = manager();

        let old = manager.add_observer("ui", Observer::new()).await.unwrap();
        let new = manager.add_observer("ui", Observer::new()).await.unwrap();
        assert_ne!(old.id(), new.id());

        old.unregister();
        assert!(manager.remove_observer("ui").await.unwrap());
        let _ = new.detach();
    }
}
