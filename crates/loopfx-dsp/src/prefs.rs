//! Preference values and stores.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::DspResult;

/// A stored preference value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrefValue {
    Bool(bool),
    Int(i32),
    Float(f32),
    Text(String),
}

/// Types that can be read from the preference cache.
pub trait PrefType: Clone + Into<PrefValue> {
    /// Convert a stored value, `None` if the types do not match.
    fn from_value(value: &PrefValue) -> Option<Self>;
}

impl From<bool> for PrefValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for PrefValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<f32> for PrefValue {
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<String> for PrefValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl PrefType for bool {
    fn from_value(value: &PrefValue) -> Option<Self> {
        match value {
            PrefValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl PrefType for i32 {
    fn from_value(value: &PrefValue) -> Option<Self> {
        match value {
            PrefValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl PrefType for f32 {
    fn from_value(value: &PrefValue) -> Option<Self> {
        match value {
            PrefValue::Float(v) => Some(*v),
            // JSON has no separate integer literal for floats like `60`.
            PrefValue::Int(v) => Some(*v as f32),
            _ => None,
        }
    }
}

impl PrefType for String {
    fn from_value(value: &PrefValue) -> Option<Self> {
        match value {
            PrefValue::Text(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Read access to persisted preferences, grouped by namespace.
pub trait PreferenceStore: Send + Sync {
    fn value(&self, namespace: &str, key: &str) -> Option<PrefValue>;
}

/// In-memory preference store.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    namespaces: RwLock<HashMap<String, HashMap<String, PrefValue>>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `{"namespace": {"key": value}}`.
    pub fn from_json(json: &str) -> DspResult<Self> {
        let namespaces: HashMap<String, HashMap<String, PrefValue>> = serde_json::from_str(json)?;
        Ok(Self::from_map(namespaces))
    }

    pub fn from_map(namespaces: HashMap<String, HashMap<String, PrefValue>>) -> Self {
        Self {
            namespaces: RwLock::new(namespaces),
        }
    }

    pub fn set(&self, namespace: &str, key: &str, value: impl Into<PrefValue>) {
        self.namespaces
            .write()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn remove(&self, namespace: &str, key: &str) {
        if let Some(values) = self.namespaces.write().get_mut(namespace) {
            values.remove(key);
        }
    }
}

impl PreferenceStore for MemoryPreferences {
    fn value(&self, namespace: &str, key: &str) -> Option<PrefValue> {
        self.namespaces.read().get(namespace)?.get(key).cloned()
    }
}
