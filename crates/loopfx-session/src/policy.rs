//! Per-package capture policy, diffed against platform allow/deny logs.

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bus::EventBus;
use crate::model::CapturePermissionLog;
use crate::UNRESOLVED_UID;

/// Resolves package names to uids.
pub trait PackageResolver: Send + Sync {
    /// `None` when the package is unknown or not yet installed.
    fn uid_for_package(&self, package_name: &str) -> Option<i32>;
}

/// Capture policy of one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEntry {
    /// Owning uid, or [`UNRESOLVED_UID`].
    pub uid: i32,
    pub package_name: String,
    /// The package does not allow its playback to be captured.
    pub restricted: bool,
}

/// Difference between the stored policy and a new log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyDiff {
    pub added: Vec<PolicyEntry>,
    pub removed: Vec<PolicyEntry>,
    /// Entries whose restricted flag flipped, with the new value.
    pub updated: Vec<PolicyEntry>,
}

impl PolicyDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    /// A minor update leaves the set of restricted packages untouched.
    pub fn is_minor_update(&self) -> bool {
        !self.added.iter().any(|e| e.restricted)
            && !self.removed.iter().any(|e| e.restricted)
            && self.updated.is_empty()
    }
}

/// Published after every update that changed something.
#[derive(Debug, Clone)]
pub struct PolicyUpdate {
    pub entries: Arc<BTreeMap<String, PolicyEntry>>,
    pub is_minor_update: bool,
}

struct PolicyState {
    entries: BTreeMap<String, PolicyEntry>,
    destroyed: bool,
}

/// Tracks which packages forbid capture.
pub struct SessionPolicyTracker {
    own_package: String,
    resolver: Arc<dyn PackageResolver>,
    state: Mutex<PolicyState>,
    events: EventBus<PolicyUpdate>,
}

impl SessionPolicyTracker {
    pub fn new(own_package: impl Into<String>, resolver: Arc<dyn PackageResolver>) -> Self {
        Self {
            own_package: own_package.into(),
            resolver,
            state: Mutex::new(PolicyState {
                entries: BTreeMap::new(),
                destroyed: false,
            }),
            events: EventBus::new(),
        }
    }

    pub fn subscribe(&self) -> Receiver<PolicyUpdate> {
        self.events.subscribe()
    }

    /// Compare a permission log (package → capture allowed) with the stored map.
    pub fn diff(&self, log: &CapturePermissionLog) -> PolicyDiff {
        let state = self.state.lock();
        self.diff_locked(&state.entries, log)
    }

    /// Apply a permission log. Listeners hear about it only if something changed.
    pub fn update(&self, log: &CapturePermissionLog) -> PolicyDiff {
        let mut state = self.state.lock();
        if state.destroyed {
            return PolicyDiff::default();
        }

        let diff = self.diff_locked(&state.entries, log);
        if diff.is_empty() {
            return diff;
        }

        for entry in &diff.removed {
            state.entries.remove(&entry.package_name);
        }
        for entry in diff.added.iter().chain(&diff.updated) {
            state.entries.insert(entry.package_name.clone(), entry.clone());
        }

        let is_minor_update = diff.is_minor_update();
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            updated = diff.updated.len(),
            is_minor_update,
            "Capture policy changed"
        );
        self.events.publish(PolicyUpdate {
            entries: Arc::new(state.entries.clone()),
            is_minor_update,
        });
        diff
    }

    /// Resolved uids of restricted packages.
    pub fn restricted_uids(&self) -> Vec<i32> {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.restricted && e.uid > 0)
            .map(|e| e.uid)
            .collect()
    }

    pub fn entries(&self) -> BTreeMap<String, PolicyEntry> {
        self.state.lock().entries.clone()
    }

    pub fn clear(&self) {
        debug!("Clearing capture policy");
        self.state.lock().entries.clear();
    }

    /// Clear and ignore all further logs.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.destroyed = true;
    }

    fn diff_locked(
        &self,
        entries: &BTreeMap<String, PolicyEntry>,
        log: &CapturePermissionLog,
    ) -> PolicyDiff {
        let mut diff = PolicyDiff::default();

        let mut packages: Vec<(&String, &bool)> = log.iter().collect();
        packages.sort();

        for (package, &allowed) in packages {
            if *package == self.own_package {
                continue;
            }
            let restricted = !allowed;
            match entries.get(package) {
                None => diff.added.push(PolicyEntry {
                    uid: self
                        .resolver
                        .uid_for_package(package)
                        .unwrap_or(UNRESOLVED_UID),
                    package_name: package.clone(),
                    restricted,
                }),
                Some(existing) if existing.restricted != restricted => {
                    diff.updated.push(PolicyEntry {
                        restricted,
                        ..existing.clone()
                    })
                }
                Some(_) => {}
            }
        }

        diff.removed = entries
            .values()
            .filter(|e| !log.contains_key(&e.package_name))
            .cloned()
            .collect();

        diff
    }
}
