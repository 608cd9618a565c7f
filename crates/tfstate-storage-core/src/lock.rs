use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Holder prefix reserved for the short-lived locks a delete takes on the
/// state it removes. Callers cannot lock with it.
pub const FENCE_HOLDER_PREFIX: &str = "tfstate-delete:";

/// A fresh holder identity for a delete fence.
pub fn fence_holder() -> String {
    format!("{}{}", FENCE_HOLDER_PREFIX, uuid::Uuid::new_v4())
}

/// An outstanding lock on one state name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier for this acquisition
    pub id: String,
    /// Opaque identity of whoever holds the lock
    pub holder: String,
    /// When the lock was acquired
    pub created_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(holder: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            holder: holder.into(),
            created_at: Utc::now(),
        }
    }

    pub fn is_held_by(&self, holder: &str) -> bool {
        self.holder == holder
    }

    /// Whether this lock is a delete fence rather than a caller's lock.
    pub fn is_fence(&self) -> bool {
        self.holder.starts_with(FENCE_HOLDER_PREFIX)
    }

    /// Whether `mode` may remove this lock. Force never removes a fence.
    pub fn releasable_by(&self, mode: UnlockMode<'_>) -> bool {
        match mode {
            UnlockMode::Holder(holder) => self.is_held_by(holder),
            UnlockMode::Force => !self.is_fence(),
        }
    }
}

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquireResult {
    /// The state was unlocked and is now locked by the caller.
    Acquired(LockInfo),
    /// The caller already held the lock; nothing changed.
    AlreadyHeld(LockInfo),
    /// Someone else holds the lock; nothing changed.
    HeldBy(LockInfo),
}

impl LockAcquireResult {
    /// Whether the caller holds the lock after this call.
    pub fn acquired(&self) -> bool {
        !matches!(self, LockAcquireResult::HeldBy(_))
    }
}

/// Who is asking for a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockMode<'a> {
    /// Release only if `holder` is the current holder.
    Holder(&'a str),
    /// Release regardless of the current holder, unless it is a delete fence.
    Force,
}

/// Result of a lock release attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockReleaseResult {
    /// The lock was removed; carries the lock that was released.
    Released(LockInfo),
    /// There was no lock to release.
    NotLocked,
    /// The lock may not be released in this mode; nothing changed.
    HolderMismatch(LockInfo),
    /// A forced release removed a lock record that could not be read.
    DiscardedUnreadable,
}

/// Per-state mutual exclusion.
///
/// Each state name has an independent lock that is either unlocked or held by
/// exactly one holder. Implementations must make `try_lock` and `unlock`
/// atomic with respect to every other caller of the same backing store,
/// including other processes: a read of the current holder followed by a
/// separate write is not acceptable. Calls on different names must not
/// contend with each other.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Returns the lock implementation identifier (e.g., "memory", "file").
    fn lock_type(&self) -> &'static str;

    /// Compare-and-set: take the lock on `name` for `holder` if it is free.
    async fn try_lock(&self, name: &str, holder: &str) -> Result<LockAcquireResult, StorageError>;

    /// Release the lock on `name`.
    async fn unlock(
        &self,
        name: &str,
        mode: UnlockMode<'_>,
    ) -> Result<LockReleaseResult, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_info_new() {
        let lock = LockInfo::new("cli-123");
        assert_eq!(lock.holder, "cli-123");
        assert!(!lock.id.is_empty());
        assert!(lock.is_held_by("cli-123"));
        assert!(!lock.is_held_by("cli-456"));
    }

    #[test]
    fn test_lock_info_serialization() {
        let lock = LockInfo::new("cli-123");
        let json = serde_json::to_string(&lock).unwrap();
        let deserialized: LockInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, lock);
    }

    #[test]
    fn test_acquire_result_acquired() {
        let lock = LockInfo::new("h");
        assert!(LockAcquireResult::Acquired(lock.clone()).acquired());
        assert!(LockAcquireResult::AlreadyHeld(lock.clone()).acquired());
        assert!(!LockAcquireResult::HeldBy(lock).acquired());
    }

    #[test]
    fn test_fence_is_never_forced() {
        let fence = LockInfo::new(fence_holder());
        assert!(fence.is_fence());
        assert!(!fence.releasable_by(UnlockMode::Force));
        assert!(!fence.releasable_by(UnlockMode::Holder("cli-123")));
        assert!(fence.releasable_by(UnlockMode::Holder(&fence.holder)));

        let lock = LockInfo::new("cli-123");
        assert!(!lock.is_fence());
        assert!(lock.releasable_by(UnlockMode::Force));
        assert!(!lock.releasable_by(UnlockMode::Holder("cli-456")));
    }
}
