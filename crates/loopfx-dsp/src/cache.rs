//! Namespaced preference cache with dirty tracking.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::trace;

use crate::prefs::{PrefType, PrefValue, PreferenceStore};

/// Capacity of the diagnostics side channel. Reads beyond it are dropped.
pub const DIAGNOSTICS_CHANNEL_CAPACITY: usize = 256;

/// A preference read, mirrored for crash reports.
#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceRead {
    pub namespace: String,
    pub key: String,
    pub value: PrefValue,
}

/// Remembers the last value read per key and which namespaces changed since
/// the last commit.
pub struct PreferenceCache {
    store: Arc<dyn PreferenceStore>,
    selected: Option<String>,
    values: HashMap<String, HashMap<String, PrefValue>>,
    changed: Vec<String>,
    diagnostics: Option<Sender<PreferenceRead>>,
}

impl PreferenceCache {
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        Self {
            store,
            selected: None,
            values: HashMap::new(),
            changed: Vec::new(),
            diagnostics: None,
        }
    }

    /// Mirror every read into a bounded channel. Replaces any previous receiver.
    pub fn diagnostics(&mut self) -> Receiver<PreferenceRead> {
        let (tx, rx) = crossbeam_channel::bounded(DIAGNOSTICS_CHANNEL_CAPACITY);
        self.diagnostics = Some(tx);
        rx
    }

    /// Select the namespace for subsequent reads.
    pub fn select(&mut self, namespace: &str) {
        self.selected = Some(namespace.to_string());
    }

    /// Read a value from the selected namespace.
    ///
    /// # Panics
    ///
    /// Panics if no namespace was selected.
    pub fn get<T: PrefType>(&mut self, key: &str, default: T) -> T {
        let namespace = self
            .selected
            .clone()
            .expect("PreferenceCache::get called without a selected namespace");

        let value = self
            .store
            .value(&namespace, key)
            .and_then(|v| T::from_value(&v))
            .unwrap_or(default);
        let stored: PrefValue = value.clone().into();

        let cached = self.values.entry(namespace.clone()).or_default();
        if cached.get(key) != Some(&stored) {
            trace!(namespace = %namespace, key, "Preference changed");
            cached.insert(key.to_string(), stored.clone());
            if !self.changed.contains(&namespace) {
                self.changed.push(namespace.clone());
            }
        }

        if let Some(tx) = &self.diagnostics {
            let _ = tx.try_send(PreferenceRead {
                namespace,
                key: key.to_string(),
                value: stored,
            });
        }

        value
    }

    /// Namespaces with a changed value since the last commit, in first-touched order.
    pub fn changed_namespaces(&self) -> &[String] {
        &self.changed
    }

    pub fn mark_changes_as_committed(&mut self) {
        self.changed.clear();
    }

    /// Forget all cached values so every namespace reads as changed again.
    pub fn clear(&mut self) {
        self.values.clear();
        self.changed.clear();
    }
}
