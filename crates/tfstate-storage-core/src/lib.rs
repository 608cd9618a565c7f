//! Core types for state storage plugins.
//!
//! A plugin persists and locks named, opaque state blobs on behalf of an
//! orchestrator. This crate defines:
//! - `StorageServer`: the operation set the orchestrator calls
//! - `StateStorage`: the generic server enforcing the configure gate and the
//!   per-state lock discipline
//! - `BlobStore` / `LockManager`: the persistence seams a backend fills
//! - `BackendProvider`: turns a validated configuration into a backend
//! - `Diagnostics`: severity-tagged results returned next to every value

mod config;
mod diagnostics;
mod error;
mod lock;
mod memory;
mod server;
mod storage;

pub use config::{json_type_name, StorageConfig};
pub use diagnostics::{Diagnosed, Diagnostic, Diagnostics, Severity};
pub use error::StorageError;
pub use lock::{
    fence_holder, LockAcquireResult, LockInfo, LockManager, LockReleaseResult, UnlockMode,
};
pub use memory::{MemoryBlobStore, MemoryLockManager, MemoryProvider};
pub use server::{StateStorage, StorageServer};
pub use storage::{validate_state_name, BackendProvider, BlobStore, OpenedBackend};
