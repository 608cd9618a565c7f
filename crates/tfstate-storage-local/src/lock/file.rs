use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use tfstate_storage_core::{
    LockAcquireResult, LockInfo, LockManager, LockReleaseResult, StorageError, UnlockMode,
};
use tracing::{debug, instrument, warn};

use crate::paths::{check_state_file_name, temp_path_for};

/// File-based lock manager, safe across processes sharing a directory.
///
/// Per state name there are two files under `{locks_dir}`:
/// - `{name}.lock`: JSON `LockInfo` of the current holder, absent when unlocked
/// - `{name}.guard`: never holds data; an exclusive OS lock on it (flock on
///   Unix, LockFileEx on Windows) serializes every read-modify-write of the
///   `.lock` file for that name
///
/// The guard is held only for the duration of one compare-and-set, so
/// operations on different names never contend.
///
/// Guard files are kept once created, so `locks_dir` holds one empty
/// `.guard` per name ever locked or deleted. Removing a guard would let a
/// process waiting on the unlinked inode and a newcomer on a fresh file both
/// enter the critical section.
#[derive(Debug, Clone)]
pub struct FileLock {
    locks_dir: PathBuf,
}

impl FileLock {
    /// Create a new FileLock storing lock files in `locks_dir`.
    pub fn new(locks_dir: impl AsRef<Path>) -> Self {
        Self {
            locks_dir: locks_dir.as_ref().to_path_buf(),
        }
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", name))
    }

    fn guard_path(&self, name: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.guard", name))
    }

    /// Ensure the locks directory exists.
    fn ensure_locks_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.locks_dir).map_err(|e| {
            StorageError::Io(format!(
                "Failed to create locks dir {}: {}",
                self.locks_dir.display(),
                e
            ))
        })
    }

    /// Run `f` while holding the exclusive guard for `name`.
    fn with_guard<T>(
        &self,
        name: &str,
        f: impl FnOnce(&Path) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        self.ensure_locks_dir()?;
        let guard_path = self.guard_path(name);
        let guard = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&guard_path)
            .map_err(|e| StorageError::Io(format!("Failed to open lock guard: {}", e)))?;

        guard
            .lock_exclusive()
            .map_err(|e| StorageError::Lock(format!("Failed to take lock guard: {}", e)))?;

        let result = f(&self.lock_path(name));

        if let Err(e) = FileExt::unlock(&guard) {
            // Dropping the handle releases it anyway.
            warn!("Failed to unlock guard {}: {}", guard_path.display(), e);
        }
        result
    }

    /// Run a guarded operation on the blocking pool.
    async fn run_guarded<T, F>(&self, name: &str, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, StorageError> + Send + 'static,
    {
        check_state_file_name(name)?;
        let this = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || this.with_guard(&name, f))
            .await
            .map_err(|e| StorageError::Internal(format!("Lock task failed: {}", e)))?
    }
}

/// Read the lock file, `None` if there is none.
fn read_lock_file(path: &Path) -> Result<Option<LockInfo>, StorageError> {
    match fs::read(path) {
        Ok(content) => serde_json::from_slice(&content).map(Some).map_err(|e| {
            StorageError::Serialization(format!(
                "Unreadable lock file {}: {}",
                path.display(),
                e
            ))
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io(format!("Failed to read lock file: {}", e))),
    }
}

/// Write the lock file atomically via a temp file.
fn write_lock_file(path: &Path, lock: &LockInfo) -> Result<(), StorageError> {
    let temp_path = temp_path_for(path);
    let content = serde_json::to_vec(lock)
        .map_err(|e| StorageError::Serialization(format!("Failed to serialize lock: {}", e)))?;

    let write = || -> std::io::Result<()> {
        let mut file = File::create(&temp_path)?;
        std::io::Write::write_all(&mut file, &content)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        StorageError::Io(format!("Failed to write lock file: {}", e))
    })
}

fn remove_lock_file(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::Io(format!("Failed to delete lock: {}", e))),
    }
}

#[async_trait]
impl LockManager for FileLock {
    fn lock_type(&self) -> &'static str {
        "file"
    }

    #[instrument(skip(self), level = "debug")]
    async fn try_lock(&self, name: &str, holder: &str) -> Result<LockAcquireResult, StorageError> {
        let holder = holder.to_string();
        let state = name.to_string();
        self.run_guarded(name, move |path| {
            if let Some(existing) = read_lock_file(path)? {
                if existing.is_held_by(&holder) {
                    debug!("Lock on {} already held by {}", state, holder);
                    return Ok(LockAcquireResult::AlreadyHeld(existing));
                }
                debug!(
                    "Lock on {} held by {} (requested by {})",
                    state, existing.holder, holder
                );
                return Ok(LockAcquireResult::HeldBy(existing));
            }

            let lock = LockInfo::new(holder.as_str());
            write_lock_file(path, &lock)?;
            debug!("Acquired lock on {} for {}", state, holder);
            Ok(LockAcquireResult::Acquired(lock))
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn unlock(
        &self,
        name: &str,
        mode: UnlockMode<'_>,
    ) -> Result<LockReleaseResult, StorageError> {
        let holder = match mode {
            UnlockMode::Holder(holder) => Some(holder.to_string()),
            UnlockMode::Force => None,
        };
        let state = name.to_string();
        self.run_guarded(name, move |path| {
            let existing = match (read_lock_file(path), &holder) {
                (Ok(Some(existing)), _) => existing,
                (Ok(None), _) => return Ok(LockReleaseResult::NotLocked),
                // A corrupt lock file can only be cleared with force.
                (Err(StorageError::Serialization(msg)), None) => {
                    warn!("Force-removing unreadable lock on {}: {}", state, msg);
                    remove_lock_file(path)?;
                    return Ok(LockReleaseResult::DiscardedUnreadable);
                }
                (Err(e), _) => return Err(e),
            };

            let mode = match &holder {
                Some(holder) => UnlockMode::Holder(holder),
                None => UnlockMode::Force,
            };
            if !existing.releasable_by(mode) {
                debug!("Cannot release lock on {} held by {}", state, existing.holder);
                return Ok(LockReleaseResult::HolderMismatch(existing));
            }

            remove_lock_file(path)?;
            debug!("Released lock on {} (was held by {})", state, existing.holder);
            Ok(LockReleaseResult::Released(existing))
        })
        .await
    }
}
