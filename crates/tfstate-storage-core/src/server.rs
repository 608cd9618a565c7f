use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::StorageConfig;
use crate::diagnostics::{Diagnosed, Diagnostic, Diagnostics};
use crate::lock::{
    fence_holder, LockAcquireResult, LockInfo, LockReleaseResult, UnlockMode, FENCE_HOLDER_PREFIX,
};
use crate::storage::{validate_state_name, BackendProvider, OpenedBackend};

/// The operation set a state storage plugin exposes to the orchestrator.
///
/// Every method reports problems as diagnostics next to its result instead of
/// failing; an error-severity diagnostic marks the operation as failed.
#[async_trait]
pub trait StorageServer: Send + Sync {
    /// Dry-run validation of a configuration. No side effects.
    async fn validate_config(&self, storage_name: &str, config: &StorageConfig) -> Diagnostics;

    /// Apply a configuration. Must succeed before any state operation.
    async fn configure(&self, storage_name: &str, config: &StorageConfig) -> Diagnostics;

    /// Names of all states that have persisted content.
    async fn list_states(&self) -> Diagnosed<Vec<String>>;

    /// Current blob for `name`; empty without error if it was never written.
    async fn read_state(&self, name: &str) -> Diagnosed<Vec<u8>>;

    /// Replace the blob for `name`. Does not take or release any lock.
    async fn write_state(&self, name: &str, data: &[u8]) -> Diagnostics;

    /// Take the lock on `name` for `holder`.
    async fn lock_state(&self, name: &str, holder: &str) -> Diagnostics;

    /// Release the lock on `name`. `force` skips the holder check.
    async fn unlock_state(&self, name: &str, holder: &str, force: bool) -> Diagnostics;

    /// Remove `name` entirely. Refused while someone other than `holder`
    /// holds its lock; with no `holder`, refused while locked at all.
    async fn delete_state(&self, name: &str, holder: Option<&str>) -> Diagnostics;
}

struct ConfiguredBackend {
    storage_name: &'static str,
    backend: OpenedBackend,
}

/// Generic storage server over a set of selectable providers.
///
/// Lifecycle: validate, configure once, then any number of state operations.
/// State operations before a successful configure short-circuit with a
/// "Backend not configured" error and touch nothing.
///
/// Locking policy: re-locking by the current holder succeeds without a
/// diagnostic and does not nest, so a single unlock releases it.
///
/// A delete fences its state with a lock under a reserved holder. Callers
/// never see that holder: lock attempts report a delete in progress and
/// unlocks treat the state as unlocked.
pub struct StateStorage {
    providers: Vec<Arc<dyn BackendProvider>>,
    configured: OnceLock<ConfiguredBackend>,
    configure_guard: Mutex<()>,
}

impl StateStorage {
    pub fn new(providers: Vec<Arc<dyn BackendProvider>>) -> Self {
        Self {
            providers,
            configured: OnceLock::new(),
            configure_guard: Mutex::new(()),
        }
    }

    /// Storage names that can be configured.
    pub fn storage_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn is_configured(&self) -> bool {
        self.configured.get().is_some()
    }

    /// Name of the configured storage, if any.
    pub fn configured_storage(&self) -> Option<&'static str> {
        self.configured.get().map(|c| c.storage_name)
    }

    /// Resolve a provider by name. An empty name selects the only provider
    /// when exactly one is registered.
    fn provider(&self, storage_name: &str) -> Result<&Arc<dyn BackendProvider>, Diagnostic> {
        if storage_name.is_empty() && self.providers.len() == 1 {
            return Ok(&self.providers[0]);
        }
        self.providers
            .iter()
            .find(|p| p.name() == storage_name)
            .ok_or_else(|| {
                Diagnostic::error(
                    "Unsupported storage type",
                    format!(
                        "storage \"{}\" is not provided by this plugin (available: {})",
                        storage_name,
                        self.storage_names().join(", ")
                    ),
                )
                .with_attribute("storage_name")
            })
    }

    fn backend(&self) -> Result<&OpenedBackend, Diagnostic> {
        self.configured
            .get()
            .map(|c| &c.backend)
            .ok_or_else(|| {
                Diagnostic::error(
                    "Backend not configured",
                    "the storage must be configured successfully before states can be used",
                )
            })
    }

    /// Common gate for state-scoped operations.
    fn state_backend(&self, name: &str) -> Result<&OpenedBackend, Diagnostic> {
        let backend = self.backend()?;
        validate_state_name(name)?;
        Ok(backend)
    }
}

impl std::fmt::Debug for StateStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStorage")
            .field("providers", &self.storage_names())
            .field("configured", &self.configured_storage())
            .finish()
    }
}

fn delete_in_progress(name: &str) -> Diagnostic {
    Diagnostic::error(
        "Delete in progress",
        format!(
            "state \"{}\" is being deleted; retry once the delete has finished",
            name
        ),
    )
}

fn held_by_detail(name: &str, lock: &LockInfo) -> String {
    format!(
        "state \"{}\" is held by {} (lock ID {}, acquired {})",
        name,
        lock.holder,
        lock.id,
        lock.created_at.to_rfc3339()
    )
}

#[async_trait]
impl StorageServer for StateStorage {
    #[instrument(skip(self, config), level = "debug")]
    async fn validate_config(&self, storage_name: &str, config: &StorageConfig) -> Diagnostics {
        match self.provider(storage_name) {
            Ok(provider) => provider.validate(config),
            Err(diag) => diag.into(),
        }
    }

    #[instrument(skip(self, config), level = "debug")]
    async fn configure(&self, storage_name: &str, config: &StorageConfig) -> Diagnostics {
        let _guard = self.configure_guard.lock().await;

        if let Some(existing) = self.configured.get() {
            return Diagnostic::error(
                "Backend already configured",
                format!(
                    "storage \"{}\" is already configured for this plugin process",
                    existing.storage_name
                ),
            )
            .into();
        }

        let provider = match self.provider(storage_name) {
            Ok(provider) => Arc::clone(provider),
            Err(diag) => return diag.into(),
        };

        let mut diags = provider.validate(config);
        if diags.has_errors() {
            debug!("Configuration for {} rejected", provider.name());
            return diags;
        }

        match provider.open(config).await {
            Ok(backend) => {
                info!(
                    "Configured {} storage ({} blobs, {} locks)",
                    provider.name(),
                    backend.blobs.backend_name(),
                    backend.locks.lock_type()
                );
                // Cannot already be set: we hold the configure guard.
                let _ = self.configured.set(ConfiguredBackend {
                    storage_name: provider.name(),
                    backend,
                });
            }
            Err(e) => {
                warn!("Failed to open {} storage: {}", provider.name(), e);
                diags.push(e.into());
            }
        }
        diags
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_states(&self) -> Diagnosed<Vec<String>> {
        let backend = match self.backend() {
            Ok(backend) => backend,
            Err(diag) => return Diagnosed::failed(diag),
        };
        match backend.blobs.list().await {
            Ok(names) => Diagnosed::ok(names),
            Err(e) => Diagnosed::failed(e),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_state(&self, name: &str) -> Diagnosed<Vec<u8>> {
        let backend = match self.state_backend(name) {
            Ok(backend) => backend,
            Err(diag) => return Diagnosed::failed(diag),
        };
        match backend.blobs.read(name).await {
            Ok(data) => Diagnosed::ok(data.unwrap_or_default()),
            Err(e) => Diagnosed::failed(e),
        }
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn write_state(&self, name: &str, data: &[u8]) -> Diagnostics {
        let backend = match self.state_backend(name) {
            Ok(backend) => backend,
            Err(diag) => return diag.into(),
        };
        match backend.blobs.write(name, data).await {
            Ok(()) => Diagnostics::new(),
            Err(e) => e.into(),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn lock_state(&self, name: &str, holder: &str) -> Diagnostics {
        let backend = match self.state_backend(name) {
            Ok(backend) => backend,
            Err(diag) => return diag.into(),
        };
        if holder.is_empty() || holder.starts_with(FENCE_HOLDER_PREFIX) {
            return Diagnostic::error(
                "Invalid lock holder",
                format!(
                    "a non-empty holder identity not starting with \"{}\" is required to lock state \"{}\"",
                    FENCE_HOLDER_PREFIX, name
                ),
            )
            .into();
        }

        match backend.locks.try_lock(name, holder).await {
            Ok(LockAcquireResult::Acquired(_)) | Ok(LockAcquireResult::AlreadyHeld(_)) => {
                Diagnostics::new()
            }
            Ok(LockAcquireResult::HeldBy(existing)) if existing.is_fence() => {
                delete_in_progress(name).into()
            }
            Ok(LockAcquireResult::HeldBy(existing)) => {
                Diagnostic::error("State already locked", held_by_detail(name, &existing)).into()
            }
            Err(e) => e.into(),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn unlock_state(&self, name: &str, holder: &str, force: bool) -> Diagnostics {
        let backend = match self.state_backend(name) {
            Ok(backend) => backend,
            Err(diag) => return diag.into(),
        };
        let mode = if force {
            UnlockMode::Force
        } else {
            UnlockMode::Holder(holder)
        };

        match backend.locks.unlock(name, mode).await {
            Ok(LockReleaseResult::Released(previous)) => {
                if force && !previous.is_held_by(holder) {
                    warn!(
                        "Force-unlocked state {} held by {} (requested by {})",
                        name, previous.holder, holder
                    );
                    Diagnostic::warning(
                        "State lock forcibly released",
                        format!(
                            "lock {} on state \"{}\" held by {} was released by {} without holder verification",
                            previous.id, name, previous.holder, holder
                        ),
                    )
                    .into()
                } else if force {
                    warn!("Force-unlocked state {} by its own holder {}", name, holder);
                    Diagnostic::warning(
                        "State lock forcibly released",
                        format!("lock {} on state \"{}\" was released with force", previous.id, name),
                    )
                    .into()
                } else {
                    Diagnostics::new()
                }
            }
            Ok(LockReleaseResult::DiscardedUnreadable) => {
                warn!("Force-unlocked state {}: unreadable lock record removed", name);
                Diagnostic::warning(
                    "Unreadable lock removed",
                    format!(
                        "the lock record of state \"{}\" could not be read and was removed by {} without holder verification",
                        name, holder
                    ),
                )
                .into()
            }
            Ok(LockReleaseResult::NotLocked) => Diagnostics::new(),
            // Nobody holds a fence from the caller's point of view.
            Ok(LockReleaseResult::HolderMismatch(existing)) if existing.is_fence() => {
                debug!("Unlock of {} during a delete is a no-op", name);
                Diagnostics::new()
            }
            Ok(LockReleaseResult::HolderMismatch(existing)) => Diagnostic::error(
                "Lock holder mismatch",
                format!(
                    "state \"{}\" is held by {}, not {}; unlock with force to release it anyway",
                    name, existing.holder, holder
                ),
            )
            .into(),
            Err(e) => e.into(),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_state(&self, name: &str, holder: Option<&str>) -> Diagnostics {
        let backend = match self.state_backend(name) {
            Ok(backend) => backend,
            Err(diag) => return diag.into(),
        };

        // Fence the delete with a lock of our own so nobody can lock the
        // state between the check and the removal.
        let fence = fence_holder();
        let fenced = match backend.locks.try_lock(name, &fence).await {
            Ok(LockAcquireResult::Acquired(_)) => true,
            Ok(LockAcquireResult::HeldBy(existing)) if existing.is_fence() => {
                return delete_in_progress(name).into();
            }
            Ok(LockAcquireResult::HeldBy(existing))
            | Ok(LockAcquireResult::AlreadyHeld(existing)) => {
                if !holder.is_some_and(|h| existing.is_held_by(h)) {
                    return Diagnostic::error(
                        "Cannot delete a locked state",
                        held_by_detail(name, &existing),
                    )
                    .into();
                }
                false
            }
            Err(e) => return e.into(),
        };

        let mut diags = match backend.blobs.delete(name).await {
            Ok(existed) => {
                debug!("Deleted state {} (existed: {})", name, existed);
                Diagnostics::new()
            }
            Err(e) => e.into(),
        };

        if fenced {
            if let Err(e) = backend.locks.unlock(name, UnlockMode::Holder(&fence)).await {
                warn!("Failed to release delete fence on {}: {}", name, e);
                diags.push(e.into());
            }
        }
        diags
    }
}
