//! Durable list of peripherals the platform may reconnect on our behalf.
//!
//! Each record maps a peripheral to the [`SubscriptionSpec`] to replay once
//! it is reacquired. Records are added and removed only by explicit calls
//! and survive process restarts; a disconnect never removes one.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::ble::peripheral::PeripheralId;
use crate::error::Result;
use crate::subscription::SubscriptionSpec;

/// Raw durable mapping. Keys and records are kept undecoded so that
/// unreadable entries written by other versions survive a round trip.
pub type PersistedDevices = BTreeMap<String, serde_json::Value>;

/// Storage backend for [`PersistedDevices`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Load the whole mapping. A store that was never written loads empty.
    async fn load(&self) -> Result<PersistedDevices>;

    /// Replace the whole mapping and commit it durably.
    async fn save(&self, devices: &PersistedDevices) -> Result<()>;
}

/// In-memory store. Clones share contents, which lets a test hand one clone
/// to a manager and inspect or reuse the other as if the process restarted.
#[derive(Debug, Clone, Default)]
pub struct MemoryDeviceStore {
    devices: Arc<RwLock<PersistedDevices>>,
}

impl MemoryDeviceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the stored mapping.
    pub fn snapshot(&self) -> PersistedDevices {
        self.devices.read().clone()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn load(&self) -> Result<PersistedDevices> {
        Ok(self.devices.read().clone())
    }

    async fn save(&self, devices: &PersistedDevices) -> Result<()> {
        *self.devices.write() = devices.clone();
        Ok(())
    }
}

/// JSON file store.
///
/// The file holds `{ "<peripheral>": { "<service>": ["<characteristic>", ..] } }`.
/// Saves go to a sibling temporary file which is then renamed over the
/// original.
#[derive(Debug, Clone)]
pub struct JsonFileDeviceStore {
    path: PathBuf,
}

impl JsonFileDeviceStore {
    /// Create a store backed by `path`. Nothing is touched until the first
    /// load or save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl DeviceStore for JsonFileDeviceStore {
    async fn load(&self) -> Result<PersistedDevices> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No device store at {}", self.path.display());
                return Ok(PersistedDevices::new());
            }
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_slice(&contents)?)
    }

    async fn save(&self, devices: &PersistedDevices) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let contents = serde_json::to_vec_pretty(devices)?;
        let temp = self.temp_path();

        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&contents).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}

/// Read and write access to the persisted device list.
pub struct DeviceRegistry {
    store: Box<dyn DeviceStore>,
}

impl DeviceRegistry {
    /// Wrap a store.
    pub fn new(store: impl DeviceStore + 'static) -> Self {
        Self {
            store: Box::new(store),
        }
    }

    /// Every record whose key is a valid peripheral identifier and whose
    /// value decodes as a subscription.
    ///
    /// A missing or unreadable store is treated as empty. Bad records are
    /// skipped one by one.
    pub async fn load(&self) -> BTreeMap<PeripheralId, SubscriptionSpec> {
        let raw = match self.store.load().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Device store unreadable, treating as empty: {}", e);
                return BTreeMap::new();
            }
        };

        raw.into_iter()
            .filter_map(|(key, record)| {
                let Ok(id) = PeripheralId::parse(&key) else {
                    warn!("Skipping persisted device with invalid identifier {:?}", key);
                    return None;
                };
                match serde_json::from_value::<SubscriptionSpec>(record) {
                    Ok(spec) => Some((id, spec)),
                    Err(e) => {
                        warn!("Skipping persisted device {} with unreadable record: {}", id, e);
                        None
                    }
                }
            })
            .collect()
    }

    /// Persist a record, replacing any previous one for the peripheral.
    ///
    /// # Errors
    ///
    /// Fails if the existing contents cannot be read or the commit fails.
    /// Unreadable contents are not overwritten.
    pub async fn remember(&self, peripheral: &PeripheralId, spec: SubscriptionSpec) -> Result<()> {
        let mut devices = self.store.load().await?;
        devices.insert(peripheral.to_string(), serde_json::to_value(spec)?);
        self.store.save(&devices).await?;

        info!("Remembered {} for reacquisition", peripheral);
        Ok(())
    }

    /// Remove a record. Removing an absent record is not an error and does
    /// not rewrite the store.
    pub async fn forget(&self, peripheral: &PeripheralId) -> Result<()> {
        let mut devices = self.store.load().await?;
        if devices.remove(peripheral.as_str()).is_none() {
            debug!("{} was not remembered", peripheral);
            return Ok(());
        }
        self.store.save(&devices).await?;

        info!("Forgot {} for reacquisition", peripheral);
        Ok(())
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{parse_uuid, BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID};
    use crate::error::Error;
    use pretty_assertions::assert_eq;

    fn peripheral(id: &str) -> PeripheralId {
        PeripheralId::parse(id).unwrap()
    }

    fn record(spec: &SubscriptionSpec) -> serde_json::Value {
        serde_json::to_value(spec).unwrap()
    }

    fn s1_c1() -> SubscriptionSpec {
        SubscriptionSpec::new().with_service(
            parse_uuid("0000AAA1-0000-1000-8000-00805F9B34FB").unwrap(),
            [parse_uuid("0000CCC1-0000-1000-8000-00805F9B34FB").unwrap()],
        )
    }

    #[test]
    fn test_memory_remember_then_load() {
        tokio_test::block_on(async {
            let store = MemoryDeviceStore::new();
            let registry = DeviceRegistry::new(store.clone());

            registry.remember(&peripheral("P1"), s1_c1()).await.unwrap();

            let loaded = registry.load().await;
            assert_eq!(loaded.get(&peripheral("P1")), Some(&s1_c1()));

            registry.forget(&peripheral("P1")).await.unwrap();
            assert!(registry.load().await.get(&peripheral("P1")).is_none());
            assert!(store.snapshot().is_empty());
        });
    }

    #[test]
    fn test_invalid_keys_are_skipped() {
        tokio_test::block_on(async {
            let store = MemoryDeviceStore::new();
            let mut raw = PersistedDevices::new();
            raw.insert("has space".to_string(), record(&s1_c1()));
            raw.insert("P2".to_string(), record(&s1_c1()));
            store.save(&raw).await.unwrap();

            let loaded = DeviceRegistry::new(store.clone()).load().await;
            assert_eq!(loaded.keys().collect::<Vec<_>>(), vec![&peripheral("P2")]);

            // The unreadable record is still there.
            assert_eq!(store.snapshot().len(), 2);
        });
    }

    #[tokio::test]
    async fn test_json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("devices.json");

        let registry = DeviceRegistry::new(JsonFileDeviceStore::new(&path));
        registry.remember(&peripheral("P1"), s1_c1()).await.unwrap();
        registry
            .remember(
                &peripheral("P2"),
                SubscriptionSpec::new().with_service(BATTERY_SERVICE_UUID, [BATTERY_LEVEL_UUID]),
            )
            .await
            .unwrap();

        // A fresh store on the same path stands in for a restarted process.
        let reopened = DeviceRegistry::new(JsonFileDeviceStore::new(&path));
        let loaded = reopened.load().await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(&peripheral("P1")), Some(&s1_c1()));

        reopened.forget(&peripheral("P1")).await.unwrap();
        let loaded = DeviceRegistry::new(JsonFileDeviceStore::new(&path)).load().await;
        assert!(loaded.get(&peripheral("P1")).is_none());
        assert!(loaded.contains_key(&peripheral("P2")));
    }

    #[tokio::test]
    async fn test_bad_record_does_not_hide_good_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let contents = serde_json::json!({
            "GOOD": record(&s1_c1()),
            "BAD": { "180D": ["2A37"] },
            "WORSE": 42,
        });
        tokio::fs::write(&path, serde_json::to_vec(&contents).unwrap())
            .await
            .unwrap();

        let registry = DeviceRegistry::new(JsonFileDeviceStore::new(&path));
        let loaded = registry.load().await;
        assert_eq!(loaded.keys().collect::<Vec<_>>(), vec![&peripheral("GOOD")]);
        assert_eq!(loaded.get(&peripheral("GOOD")), Some(&s1_c1()));

        // Writes still work and leave the unreadable records in place.
        registry.remember(&peripheral("P3"), s1_c1()).await.unwrap();
        registry.forget(&peripheral("GOOD")).await.unwrap();

        let raw = JsonFileDeviceStore::new(&path).load().await.unwrap();
        assert_eq!(
            raw.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["BAD", "P3", "WORSE"]
        );
        assert_eq!(raw["BAD"], serde_json::json!({ "180D": ["2A37"] }));
        assert_eq!(raw["WORSE"], serde_json::json!(42));
    }

    #[tokio::test]
    async fn test_json_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileDeviceStore::new(dir.path().join("absent.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let store = JsonFileDeviceStore::new(&path);
        assert!(matches!(store.load().await, Err(Error::Serialization(_))));

        // Reads fall back to empty, writes refuse to clobber.
        let registry = DeviceRegistry::new(JsonFileDeviceStore::new(&path));
        assert!(registry.load().await.is_empty());
        assert!(registry.remember(&peripheral("P1"), s1_c1()).await.is_err());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"{not json");
    }

    #[tokio::test]
    async fn test_unreadable_store_loads_empty() {
        let mut store = MockDeviceStore::new();
        store
            .expect_load()
            .returning(|| Err(Error::Internal("disk gone".to_string())));
        store.expect_save().never();

        let registry = DeviceRegistry::new(store);
        assert!(registry.load().await.is_empty());
        assert!(registry.forget(&peripheral("P1")).await.is_err());
    }

    #[tokio::test]
    async fn test_forget_absent_does_not_save() {
        let mut store = MockDeviceStore::new();
        store
            .expect_load()
            .times(1)
            .returning(|| Ok(PersistedDevices::new()));
        store.expect_save().never();

        let registry = DeviceRegistry::new(store);
        registry.forget(&peripheral("P1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_remember_commits_once() {
        let mut store = MockDeviceStore::new();
        store
            .expect_load()
            .times(1)
            .returning(|| Ok(PersistedDevices::new()));
        store
            .expect_save()
            .times(1)
            .withf(|devices| devices.contains_key("P1"))
            .returning(|_| Ok(()));

        let registry = DeviceRegistry::new(store);
        registry.remember(&peripheral("P1"), s1_c1()).await.unwrap();
    }
}
