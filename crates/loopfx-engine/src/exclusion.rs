//! Which uids the capture device must leave out.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use loopfx_audio::ExclusionProvider;
use loopfx_ipc::BlockedApp;
use loopfx_session::{MutedSessionBackend, SessionPoller, SessionPolicyTracker, SessionRegistry};

use crate::context::AppContext;

/// Registry type used by the service.
pub type MutedRegistry = SessionRegistry<MutedSessionBackend>;

/// User-controlled exclusion settings.
#[derive(Debug)]
pub struct ExclusionState {
    exclude_restricted: AtomicBool,
    blocklist: RwLock<Vec<BlockedApp>>,
}

impl ExclusionState {
    pub fn new(exclude_restricted: bool, blocklist: Vec<BlockedApp>) -> Self {
        Self {
            exclude_restricted: AtomicBool::new(exclude_restricted),
            blocklist: RwLock::new(blocklist),
        }
    }

    pub fn exclude_restricted(&self) -> bool {
        self.exclude_restricted.load(Ordering::SeqCst)
    }

    /// Returns whether the value changed.
    pub fn set_exclude_restricted(&self, exclude: bool) -> bool {
        self.exclude_restricted.swap(exclude, Ordering::SeqCst) != exclude
    }

    pub fn blocklist(&self) -> Vec<BlockedApp> {
        self.blocklist.read().clone()
    }

    /// Returns whether the list changed.
    pub fn set_blocklist(&self, blocklist: Vec<BlockedApp>) -> bool {
        let mut current = self.blocklist.write();
        if *current == blocklist {
            return false;
        }
        *current = blocklist;
        true
    }

    fn blocked_uids(&self) -> Vec<i32> {
        self.blocklist.read().iter().map(|app| app.uid).collect()
    }
}

impl Default for ExclusionState {
    fn default() -> Self {
        Self::new(true, Vec::new())
    }
}

/// Computes the exclusion set for each capture build and pushes it into
/// the registry before the device sees it.
pub struct ServiceExclusions {
    pub context: Arc<AppContext>,
    pub state: Arc<ExclusionState>,
    pub policy: Arc<SessionPolicyTracker>,
    pub registry: Arc<MutedRegistry>,
    pub poller: Arc<SessionPoller>,
}

impl ServiceExclusions {
    /// Current exclusion set without side effects.
    pub fn compute(&self) -> BTreeSet<i32> {
        let mut uids = BTreeSet::new();
        if self.state.exclude_restricted() {
            uids.extend(self.policy.restricted_uids());
        }
        uids.extend(self.state.blocked_uids());
        uids.insert(self.context.own_uid());
        uids
    }
}

impl ExclusionProvider for ServiceExclusions {
    fn excluded_uids(&self) -> Vec<i32> {
        let uids: Vec<i32> = self.compute().into_iter().collect();
        debug!(?uids, "Capture exclusions");
        self.registry.set_excluded_uids(uids.iter().copied());
        // Picks up sessions that are no longer excluded, restricted ones included.
        self.poller.poll_in_background();
        uids
    }
}
