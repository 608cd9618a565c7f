use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tfstate_storage_core::{BlobStore, StorageError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::paths::{check_state_file_name, temp_path_for, STATE_EXTENSION};

/// Local filesystem blob store.
///
/// ```text
/// {states_dir}/
///   {name}.tfstate
///   .{name}.tfstate.{uuid}.tmp   (in-flight writes)
/// ```
///
/// Writes land in a unique temp file that is renamed over the target, so a
/// concurrent reader sees the old blob or the new one, never a mix.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    states_dir: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage with the given states directory.
    pub fn new(states_dir: impl AsRef<Path>) -> Self {
        Self {
            states_dir: states_dir.as_ref().to_path_buf(),
        }
    }

    /// Get the path to a state file.
    fn state_path(&self, name: &str) -> PathBuf {
        self.states_dir.join(format!("{}.{}", name, STATE_EXTENSION))
    }

    /// Ensure the states directory exists.
    async fn ensure_states_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.states_dir).await.map_err(|e| {
            StorageError::Io(format!(
                "Failed to create states dir {}: {}",
                self.states_dir.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl BlobStore for LocalStorage {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self), level = "debug")]
    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = match fs::read_dir(&self.states_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to read dir {}: {}",
                    self.states_dir.display(),
                    e
                )))
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to read dir entry: {}", e)))?
        {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == STATE_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }
            names.push(stem);
        }

        names.sort();
        debug!("Listed {} states", names.len());
        Ok(names)
    }

    #[instrument(skip(self), level = "debug")]
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        check_state_file_name(name)?;
        let path = self.state_path(name);
        match fs::read(&path).await {
            Ok(data) => {
                debug!("Loaded state {} ({} bytes)", name, data.len());
                Ok(Some(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        check_state_file_name(name)?;
        self.ensure_states_dir().await?;
        let path = self.state_path(name);
        let temp_path = temp_path_for(&path);

        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&temp_path).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove temp file {}: {}", temp_path.display(), cleanup);
                }
            }
            return Err(StorageError::Io(format!(
                "Failed to write {}: {}",
                path.display(),
                e
            )));
        }

        debug!("Saved state {} ({} bytes)", name, data.len());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        check_state_file_name(name)?;
        let path = self.state_path(name);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted state {}", name);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }
}
