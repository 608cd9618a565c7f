use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StorageError;

/// Decoded, user-supplied storage configuration.
///
/// The core passes this through unexamined; each provider reads the
/// attributes it understands and rejects the rest in `validate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageConfig {
    attributes: Map<String, Value>,
}

impl StorageConfig {
    pub fn new(attributes: Map<String, Value>) -> Self {
        Self { attributes }
    }

    /// Decode a JSON-encoded configuration object.
    ///
    /// Empty input and `null` both decode to an empty configuration, matching
    /// how unset attributes arrive from the orchestrator.
    pub fn from_json(bytes: &[u8]) -> Result<Self, StorageError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        match serde_json::from_slice::<Value>(bytes)? {
            Value::Null => Ok(Self::default()),
            Value::Object(attributes) => Ok(Self { attributes }),
            other => Err(StorageError::InvalidArgument(format!(
                "storage configuration must be an object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key).filter(|v| !v.is_null())
    }

    /// Get a string attribute value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Get a boolean attribute value
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Get a boolean attribute with a default value
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    /// Attribute names that carry a non-null value.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, _)| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.keys().next().is_none()
    }
}

impl From<Map<String, Value>> for StorageConfig {
    fn from(attributes: Map<String, Value>) -> Self {
        Self::new(attributes)
    }
}

/// Human-readable JSON type name, for diagnostics about mistyped attributes.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
