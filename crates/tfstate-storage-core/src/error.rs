use thiserror::Error;

/// Errors that can occur in the persistence layer.
///
/// These never cross the `StorageServer` boundary as errors: they are turned
/// into error diagnostics there.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Short, stable summary used when the error is reported as a diagnostic.
    pub fn summary(&self) -> &'static str {
        match self {
            StorageError::Io(_) => "State storage I/O failure",
            StorageError::Serialization(_) => "State storage serialization failure",
            StorageError::NotFound(_) => "State storage resource not found",
            StorageError::Lock(_) => "State lock failure",
            StorageError::InvalidArgument(_) => "Invalid argument",
            StorageError::Internal(_) => "Internal state storage error",
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
