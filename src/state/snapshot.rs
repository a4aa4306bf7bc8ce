//! Namespaced state snapshot.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Component-private namespace.
pub const COMPONENT_NAMESPACE: &str = "component";
/// Storage watermark namespace.
pub const STORAGE_NAMESPACE: &str = "storage";

/// Input table and file watermarks supplied by the data-transfer layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputState {
    #[serde(default)]
    pub tables: Vec<Value>,
    #[serde(default)]
    pub files: Vec<Value>,
}

/// Persisted state of one configuration (or row).
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub component: Value,
    pub storage: InputState,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            component: Value::Object(Map::new()),
            storage: InputState::default(),
        }
    }
}

impl StateSnapshot {
    /// Reads a persisted snapshot. Missing or malformed namespaces are empty.
    pub fn from_value(value: &Value) -> Self {
        let component = match value.get(COMPONENT_NAMESPACE) {
            Some(v @ Value::Object(_)) => v.clone(),
            _ => Value::Object(Map::new()),
        };
        let storage = value
            .get(STORAGE_NAMESPACE)
            .and_then(|s| s.get("input"))
            .and_then(|input| serde_json::from_value(input.clone()).ok())
            .unwrap_or_default();
        Self { component, storage }
    }

    pub fn to_value(&self) -> Value {
        json!({
            COMPONENT_NAMESPACE: self.component,
            STORAGE_NAMESPACE: {
                "input": {
                    "tables": self.storage.tables,
                    "files": self.storage.files,
                }
            }
        })
    }

    pub fn is_empty(&self) -> bool {
        let component_empty = match &self.component {
            Value::Object(map) => map.is_empty(),
            Value::Null => true,
            _ => false,
        };
        component_empty && self.storage.tables.is_empty() && self.storage.files.is_empty()
    }
}
