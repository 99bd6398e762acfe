//! Extension data deltas.
//!
//! A task's extension is an open JSON object handlers use to carry state
//! between invocations. [`ExtensionDelta`] is a set of changes applied to
//! it: non-null values upsert, `null` removes the key.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Pending changes to a task's extension map.
///
/// # Examples
///
/// ```
/// use serde_json::{json, Map};
/// use taskweave::domain::ExtensionDelta;
///
/// let mut extension = Map::new();
/// extension.insert("stale".to_string(), json!(1));
///
/// let delta = ExtensionDelta::new()
///     .set("l1Flag", json!(true))
///     .remove("stale");
/// delta.apply_to(&mut extension);
///
/// assert_eq!(extension.get("l1Flag"), Some(&json!(true)));
/// assert!(!extension.contains_key("stale"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionDelta {
    changes: Map<String, Value>,
}

impl ExtensionDelta {
    /// Creates an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts `key`. Setting `Value::Null` is the same as [`remove`](Self::remove).
    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.changes.insert(key.into(), value);
        self
    }

    /// Removes `key` when applied.
    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.changes.insert(key.into(), Value::Null);
        self
    }

    /// Returns `true` if the delta changes nothing.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Merges another delta into this one; later values win.
    pub fn merge(mut self, other: ExtensionDelta) -> Self {
        self.changes.extend(other.changes);
        self
    }

    /// Applies the delta to an extension map.
    pub fn apply_to(&self, extension: &mut Map<String, Value>) {
        for (key, value) in &self.changes {
            if value.is_null() {
                extension.remove(key);
            } else {
                extension.insert(key.clone(), value.clone());
            }
        }
    }
}

impl From<Map<String, Value>> for ExtensionDelta {
    fn from(changes: Map<String, Value>) -> Self {
        Self { changes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_value_deletes() {
        let mut ext = Map::new();
        ext.insert("a".to_string(), json!(1));
        ExtensionDelta::new().set("a", Value::Null).apply_to(&mut ext);
        assert!(ext.is_empty());
    }

    #[test]
    fn merge_prefers_later_values() {
        let delta = ExtensionDelta::new()
            .set("a", json!(1))
            .merge(ExtensionDelta::new().set("a", json!(2)).set("b", json!(3)));
        let mut ext = Map::new();
        delta.apply_to(&mut ext);
        assert_eq!(ext.get("a"), Some(&json!(2)));
        assert_eq!(ext.get("b"), Some(&json!(3)));
    }

    #[test]
    fn serializes_as_plain_object() {
        let delta = ExtensionDelta::new().set("wfsFlag", json!(true));
        assert_eq!(
            serde_json::to_value(&delta).unwrap(),
            json!({"wfsFlag": true})
        );
    }
}
