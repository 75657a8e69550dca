//! Device persistence seam
//!
//! Discovery only needs one write operation and one distinguished failure:
//! "already exists". Anything else is a backend problem for that device.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::descriptor::DeviceDescriptor;

/// Storage failures
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Device already exists: {0}")]
    AlreadyExists(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

/// Persists discovered devices
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Insert a new device
    ///
    /// Must return [`StoreError::AlreadyExists`] when any of the device's
    /// tags is already taken.
    async fn create_device(&self, device: &DeviceDescriptor) -> Result<(), StoreError>;
}

/// Stored device with bookkeeping
#[derive(Debug, Clone)]
pub struct StoredDevice {
    pub descriptor: DeviceDescriptor,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inventory {
    devices: HashMap<String, StoredDevice>,
    tags: HashSet<String>,
}

/// In-memory [`DeviceStore`] enforcing tag uniqueness
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inventory>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a device by id
    pub fn get(&self, device_id: &str) -> Option<StoredDevice> {
        self.inner.read().devices.get(device_id).cloned()
    }

    /// Whether a device id is stored
    pub fn contains(&self, device_id: &str) -> bool {
        self.inner.read().devices.contains_key(device_id)
    }

    /// All descriptors, ordered by id
    pub fn list(&self) -> Vec<DeviceDescriptor> {
        let inner = self.inner.read();
        let mut devices: Vec<DeviceDescriptor> = inner
            .devices
            .values()
            .map(|d| d.descriptor.clone())
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Number of stored devices
    pub fn len(&self) -> usize {
        self.inner.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, device: &DeviceDescriptor) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        if inner.devices.contains_key(&device.id) {
            return Err(StoreError::AlreadyExists(device.canonical_tag()));
        }
        if let Some(taken) = device.all_tags().find(|t| inner.tags.contains(*t)) {
            return Err(StoreError::AlreadyExists(taken.clone()));
        }

        inner.tags.extend(device.all_tags().cloned());
        inner.devices.insert(
            device.id.clone(),
            StoredDevice {
                descriptor: device.clone(),
                created_at: Utc::now(),
            },
        );

        debug!("Store: created {}", device.canonical_tag());
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn create_device(&self, device: &DeviceDescriptor) -> Result<(), StoreError> {
        self.insert(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::build_descriptor;
    use crate::protocol::{Announcement, DeviceConfig};

    fn descriptor(id: &str) -> DeviceDescriptor {
        build_descriptor("cistern-rpc", &Announcement::new(id), &DeviceConfig::default())
    }

    #[tokio::test]
    async fn test_create_then_already_exists() {
        let store = MemoryStore::new();

        assert!(store.create_device(&descriptor("tank-1")).await.is_ok());
        let err = store.create_device(&descriptor("tank-1")).await.unwrap_err();
        assert!(err.is_already_exists());

        assert_eq!(store.len(), 1);
        assert!(store.contains("tank-1"));
        assert!(store.get("tank-1").is_some());
    }

    #[tokio::test]
    async fn test_tag_collision_is_already_exists() {
        let store = MemoryStore::new();
        let first = descriptor("tank-1");
        let mut second = descriptor("tank-2");
        second.tags.push(first.canonical_tag());

        store.create_device(&first).await.unwrap();
        assert!(matches!(
            store.create_device(&second).await,
            Err(StoreError::AlreadyExists(tag)) if tag == "device.tank-1"
        ));
        assert_eq!(store.list().len(), 1);
    }
}
