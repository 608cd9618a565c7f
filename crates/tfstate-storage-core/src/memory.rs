//! In-memory provider (`inmem`).
//!
//! Nothing outlives the process. The lock table relies on `DashMap`'s entry
//! API, which holds the shard write lock for the whole check-and-set, so two
//! racing `try_lock` calls on one name cannot both win.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::config::StorageConfig;
use crate::diagnostics::Diagnostics;
use crate::error::StorageError;
use crate::lock::{LockAcquireResult, LockInfo, LockManager, LockReleaseResult, UnlockMode};
use crate::storage::{BackendProvider, BlobStore, OpenedBackend};

/// Blob store backed by a concurrent map.
///
/// Values are swapped as whole `Arc`s, so a reader sees either the old or the
/// new blob.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Arc<Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self.blobs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blobs.get(name).map(|blob| blob.value().to_vec()))
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        self.blobs.insert(name.to_string(), Arc::new(data.to_vec()));
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.blobs.remove(name).is_some())
    }
}

/// Lock table held in process memory.
#[derive(Debug, Default)]
pub struct MemoryLockManager {
    locks: DashMap<String, LockInfo>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    fn lock_type(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self), level = "debug")]
    async fn try_lock(&self, name: &str, holder: &str) -> Result<LockAcquireResult, StorageError> {
        match self.locks.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                let existing = entry.get().clone();
                if existing.is_held_by(holder) {
                    debug!("Lock on {} already held by {}", name, holder);
                    Ok(LockAcquireResult::AlreadyHeld(existing))
                } else {
                    debug!(
                        "Lock on {} held by {} (requested by {})",
                        name, existing.holder, holder
                    );
                    Ok(LockAcquireResult::HeldBy(existing))
                }
            }
            Entry::Vacant(entry) => {
                let lock = LockInfo::new(holder);
                entry.insert(lock.clone());
                debug!("Acquired lock on {} for {}", name, holder);
                Ok(LockAcquireResult::Acquired(lock))
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn unlock(
        &self,
        name: &str,
        mode: UnlockMode<'_>,
    ) -> Result<LockReleaseResult, StorageError> {
        match self.locks.entry(name.to_string()) {
            Entry::Occupied(entry) if !entry.get().releasable_by(mode) => {
                Ok(LockReleaseResult::HolderMismatch(entry.get().clone()))
            }
            Entry::Occupied(entry) => {
                let released = entry.remove();
                debug!("Released lock on {} (was held by {})", name, released.holder);
                Ok(LockReleaseResult::Released(released))
            }
            Entry::Vacant(_) => Ok(LockReleaseResult::NotLocked),
        }
    }
}

/// Provider for the `inmem` storage type. Accepts no attributes.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryProvider;

#[async_trait]
impl BackendProvider for MemoryProvider {
    fn name(&self) -> &'static str {
        "inmem"
    }

    fn validate(&self, config: &StorageConfig) -> Diagnostics {
        let mut diags = Diagnostics::new();
        for key in config.keys() {
            diags.attribute_error(
                key,
                "Unsupported attribute",
                format!("the \"inmem\" storage does not accept an attribute named \"{}\"", key),
            );
        }
        diags
    }

    async fn open(&self, _config: &StorageConfig) -> Result<OpenedBackend, StorageError> {
        Ok(OpenedBackend {
            blobs: Arc::new(MemoryBlobStore::new()),
            locks: Arc::new(MemoryLockManager::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::fence_holder;

    #[tokio::test]
    async fn test_blob_round_trip() {
        let store = MemoryBlobStore::new();
        assert_eq!(store.read("dev").await.unwrap(), None);

        store.write("dev", b"v1").await.unwrap();
        store.write("dev", b"v2").await.unwrap();
        assert_eq!(store.read("dev").await.unwrap(), Some(b"v2".to_vec()));

        assert!(store.delete("dev").await.unwrap());
        assert!(!store.delete("dev").await.unwrap());
        assert_eq!(store.read("dev").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let store = MemoryBlobStore::new();
        store.write("prod", b"").await.unwrap();
        store.write("dev", b"").await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["dev", "prod"]);
    }

    #[tokio::test]
    async fn test_lock_unlock() {
        let locks = MemoryLockManager::new();

        let first = locks.try_lock("prod", "holder-1").await.unwrap();
        assert!(matches!(first, LockAcquireResult::Acquired(_)));

        let again = locks.try_lock("prod", "holder-1").await.unwrap();
        assert!(matches!(again, LockAcquireResult::AlreadyHeld(_)));

        let other = locks.try_lock("prod", "holder-2").await.unwrap();
        match other {
            LockAcquireResult::HeldBy(info) => assert_eq!(info.holder, "holder-1"),
            r => panic!("Expected HeldBy, got {:?}", r),
        }

        let mismatch = locks.unlock("prod", UnlockMode::Holder("holder-2")).await.unwrap();
        assert!(matches!(mismatch, LockReleaseResult::HolderMismatch(_)));
        assert!(!locks.try_lock("prod", "holder-2").await.unwrap().acquired());

        let released = locks.unlock("prod", UnlockMode::Holder("holder-1")).await.unwrap();
        assert!(matches!(released, LockReleaseResult::Released(_)));

        let noop = locks.unlock("prod", UnlockMode::Force).await.unwrap();
        assert_eq!(noop, LockReleaseResult::NotLocked);
    }

    #[tokio::test]
    async fn test_force_leaves_fence_in_place() {
        let locks = MemoryLockManager::new();
        let fence = fence_holder();
        assert!(locks.try_lock("prod", &fence).await.unwrap().acquired());

        let forced = locks.unlock("prod", UnlockMode::Force).await.unwrap();
        assert!(matches!(forced, LockReleaseResult::HolderMismatch(ref info) if info.is_fence()));

        let released = locks.unlock("prod", UnlockMode::Holder(&fence)).await.unwrap();
        assert!(matches!(released, LockReleaseResult::Released(_)));
        assert!(locks.try_lock("prod", "holder-1").await.unwrap().acquired());
    }

    #[tokio::test]
    async fn test_names_are_independent() {
        let locks = MemoryLockManager::new();
        assert!(locks.try_lock("a", "h1").await.unwrap().acquired());
        assert!(locks.try_lock("b", "h2").await.unwrap().acquired());
    }

    #[test]
    fn test_provider_rejects_attributes() {
        let config = StorageConfig::from_json(br#"{"path": "/tmp"}"#).unwrap();
        let diags = MemoryProvider.validate(&config);
        assert!(diags.has_errors());
        assert_eq!(diags.iter().next().unwrap().attribute.as_deref(), Some("path"));

        assert!(MemoryProvider.validate(&StorageConfig::default()).is_empty());
    }
}
