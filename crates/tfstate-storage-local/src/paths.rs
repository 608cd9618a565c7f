use std::path::{Path, PathBuf};

use tfstate_storage_core::{validate_state_name, StorageError};

/// Extension of persisted state blobs.
pub const STATE_EXTENSION: &str = "tfstate";

/// Reject state names that are not safe to use as a single file name.
///
/// Leading dots are reserved for temp files, which listings skip.
pub fn check_state_file_name(name: &str) -> Result<(), StorageError> {
    validate_state_name(name)?;
    if name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return Err(StorageError::InvalidArgument(format!(
            "state name \"{}\" must not start with '.' or contain path separators",
            name
        )));
    }
    Ok(())
}

/// Unique sibling path for an atomic temp-file-and-rename write.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()))
}
