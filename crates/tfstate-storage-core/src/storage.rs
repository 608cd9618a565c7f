use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StorageConfig;
use crate::diagnostics::Diagnostics;
use crate::error::StorageError;
use crate::lock::LockManager;

/// Blob persistence for named states.
///
/// Blobs are opaque. A write fully replaces the previous blob and must be
/// atomic with respect to concurrent readers of the same name.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Returns the backend identifier (e.g., "memory", "local").
    fn backend_name(&self) -> &'static str;

    /// Names of all states with persisted content.
    async fn list(&self) -> Result<Vec<String>, StorageError>;

    /// Load a state's bytes, `None` if it was never written or was deleted.
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace a state's bytes, creating the entry if needed.
    async fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Remove a state. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, StorageError>;
}

/// The persistence pair a provider hands back once configured.
#[derive(Clone)]
pub struct OpenedBackend {
    pub blobs: Arc<dyn BlobStore>,
    pub locks: Arc<dyn LockManager>,
}

impl std::fmt::Debug for OpenedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedBackend")
            .field("blobs", &self.blobs.backend_name())
            .field("locks", &self.locks.lock_type())
            .finish()
    }
}

/// A storage implementation that can be selected by name and configured.
#[async_trait]
pub trait BackendProvider: Send + Sync {
    /// Storage name this provider answers to (e.g., "local", "inmem").
    fn name(&self) -> &'static str;

    /// Dry-run validation. Must not touch storage or mutate anything.
    fn validate(&self, config: &StorageConfig) -> Diagnostics;

    /// Establish the blob store and lock manager for a validated config.
    async fn open(&self, config: &StorageConfig) -> Result<OpenedBackend, StorageError>;
}

/// Check a state name before it reaches a store.
pub fn validate_state_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() {
        return Err(StorageError::InvalidArgument(
            "state name must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_state_name() {
        assert!(validate_state_name("prod").is_ok());
        assert!(matches!(
            validate_state_name(""),
            Err(StorageError::InvalidArgument(_))
        ));
    }
}
