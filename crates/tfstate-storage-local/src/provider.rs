use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tfstate_storage_core::{
    json_type_name, BackendProvider, Diagnostics, OpenedBackend, StorageConfig, StorageError,
};
use tokio::fs;
use tracing::{debug, instrument};

use crate::lock::FileLock;
use crate::storage::LocalStorage;

/// Attributes accepted by the `local` storage.
const ATTR_PATH: &str = "path";
const ATTR_CREATE_DIRS: &str = "create_dirs";

/// Provider for the `local` storage type.
///
/// Layout under the configured `path`:
/// ```text
/// {path}/
///   states/{name}.tfstate
///   locks/{name}.lock
///   locks/{name}.guard
/// ```
#[derive(Debug, Clone)]
pub struct LocalProvider {
    default_dir: PathBuf,
}

impl LocalProvider {
    /// `default_dir` is used when the configuration has no `path`.
    pub fn new(default_dir: impl AsRef<Path>) -> Self {
        Self {
            default_dir: default_dir.as_ref().to_path_buf(),
        }
    }

    fn base_dir(&self, config: &StorageConfig) -> PathBuf {
        config
            .get_string(ATTR_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.default_dir.clone())
    }
}

#[async_trait]
impl BackendProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn validate(&self, config: &StorageConfig) -> Diagnostics {
        let mut diags = Diagnostics::new();

        for key in config.keys() {
            match (key, config.get(key)) {
                (ATTR_PATH, Some(serde_json::Value::String(path))) => {
                    if path.trim().is_empty() {
                        diags.attribute_error(
                            ATTR_PATH,
                            "Invalid storage path",
                            "\"path\" must not be empty; omit it to use the plugin's default directory",
                        );
                    }
                }
                (ATTR_CREATE_DIRS, Some(serde_json::Value::Bool(_))) => {}
                (ATTR_PATH, Some(other)) => diags.attribute_error(
                    ATTR_PATH,
                    "Invalid attribute type",
                    format!("\"path\" must be a string, got {}", json_type_name(other)),
                ),
                (ATTR_CREATE_DIRS, Some(other)) => diags.attribute_error(
                    ATTR_CREATE_DIRS,
                    "Invalid attribute type",
                    format!("\"create_dirs\" must be a bool, got {}", json_type_name(other)),
                ),
                (unknown, _) => diags.attribute_error(
                    unknown,
                    "Unsupported attribute",
                    format!(
                        "the \"local\" storage does not accept an attribute named \"{}\"",
                        unknown
                    ),
                ),
            }
        }

        diags
    }

    #[instrument(skip(self, config), level = "debug")]
    async fn open(&self, config: &StorageConfig) -> Result<OpenedBackend, StorageError> {
        let base_dir = self.base_dir(config);
        let states_dir = base_dir.join("states");
        let locks_dir = base_dir.join("locks");

        if config.get_bool_or(ATTR_CREATE_DIRS, true) {
            for dir in [&states_dir, &locks_dir] {
                fs::create_dir_all(dir).await.map_err(|e| {
                    StorageError::Io(format!("Failed to create {}: {}", dir.display(), e))
                })?;
            }
        } else if !fs::metadata(&base_dir).await.is_ok_and(|m| m.is_dir()) {
            return Err(StorageError::NotFound(format!(
                "storage directory {} does not exist and create_dirs is false",
                base_dir.display()
            )));
        }

        debug!("Opened local storage at {}", base_dir.display());
        Ok(OpenedBackend {
            blobs: Arc::new(LocalStorage::new(states_dir)),
            locks: Arc::new(FileLock::new(locks_dir)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(json: &str) -> StorageConfig {
        StorageConfig::from_json(json.as_bytes()).unwrap()
    }

    #[test]
    fn test_validate_accepts_known_attributes() {
        let provider = LocalProvider::new("/tmp/unused");
        assert!(provider.validate(&config("{}")).is_empty());
        assert!(provider
            .validate(&config(r#"{"path": "/srv/states", "create_dirs": false}"#))
            .is_empty());
    }

    #[test]
    fn test_validate_reports_each_bad_attribute() {
        let provider = LocalProvider::new("/tmp/unused");
        let diags = provider.validate(&config(
            r#"{"path": 42, "create_dirs": "yes", "bucket": "x"}"#,
        ));
        assert_eq!(diags.errors().count(), 3);

        let mut attributes: Vec<_> = diags
            .iter()
            .filter_map(|d| d.attribute.as_deref())
            .collect();
        attributes.sort();
        assert_eq!(attributes, vec!["bucket", "create_dirs", "path"]);
    }

    #[test]
    fn test_validate_rejects_blank_path() {
        let provider = LocalProvider::new("/tmp/unused");
        let diags = provider.validate(&config(r#"{"path": "  "}"#));
        assert!(diags.has_errors());
    }

    #[tokio::test]
    async fn test_open_creates_layout() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("nested").join("store");
        let provider = LocalProvider::new(temp.path());

        let cfg = config(&serde_json::json!({ "path": base }).to_string());
        let backend = provider.open(&cfg).await.unwrap();
        assert!(base.join("states").is_dir());
        assert!(base.join("locks").is_dir());
        assert_eq!(backend.blobs.backend_name(), "local");
        assert_eq!(backend.locks.lock_type(), "file");
    }

    #[tokio::test]
    async fn test_open_without_create_requires_existing_dir() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing");
        let provider = LocalProvider::new(&missing);

        let err = provider
            .open(&config(r#"{"create_dirs": false}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn test_open_uses_default_dir() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path());
        let backend = provider.open(&StorageConfig::default()).await.unwrap();

        backend.blobs.write("dev", b"v1").await.unwrap();
        assert!(temp.path().join("states").join("dev.tfstate").is_file());
    }
}
