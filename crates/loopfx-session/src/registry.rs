//! Registry of active sessions, driven by platform dumps.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::bus::EventBus;
use crate::effect::{MuteEffect, MuteEffectFactory, SessionLossCallback};
use crate::model::{SessionDump, SessionDumpEntry, SessionInfo, SessionMap};
use crate::EXCLUDED_PACKAGES;

/// Notifications published by the registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// The set of active sessions changed.
    Changed(Arc<SessionMap>),

    /// A session could not be attached and stays audible.
    AppProblem(SessionInfo),

    /// An attached session was taken over by its app.
    SessionLost(SessionInfo),
}

/// Why a dumped session was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Session 0 is the unrouted output mix.
    DefaultSession,
    OwnProcess,
    ExcludedUid,
    ProblemPackage,
    NonRecordableUsage,
}

/// What the registry does with each admitted session.
pub trait SessionBackend: Send {
    /// Per-session resource kept while the session is active.
    type Handle: Send;

    /// Set up a newly admitted session. `None` marks the app as incompatible.
    fn create_session(&mut self, session: &SessionInfo) -> Option<Self::Handle>;

    /// Tear down a session leaving the registry.
    fn release_session(&mut self, session: &SessionInfo, handle: Self::Handle);
}

struct ActiveSession<H> {
    info: SessionInfo,
    handle: H,
}

struct RegistryInner<B: SessionBackend> {
    backend: B,
    sessions: HashMap<i32, ActiveSession<B::Handle>>,
    excluded_uids: HashSet<i32>,
    destroyed: bool,
}

/// Map of active sessions keyed by session id.
pub struct SessionRegistry<B: SessionBackend> {
    own_uid: i32,
    own_package: String,
    inner: Mutex<RegistryInner<B>>,
    events: EventBus<RegistryEvent>,
}

impl<B: SessionBackend> SessionRegistry<B> {
    /// Create a registry publishing on `events`.
    pub fn new(
        own_uid: i32,
        own_package: impl Into<String>,
        backend: B,
        events: EventBus<RegistryEvent>,
    ) -> Self {
        Self {
            own_uid,
            own_package: own_package.into(),
            inner: Mutex::new(RegistryInner {
                backend,
                sessions: HashMap::new(),
                excluded_uids: HashSet::new(),
                destroyed: false,
            }),
            events,
        }
    }

    /// Subscribe to registry events. The first event is the current map.
    pub fn subscribe(&self) -> Receiver<RegistryEvent> {
        let inner = self.inner.lock();
        self.events
            .subscribe_with(RegistryEvent::Changed(Arc::new(snapshot(&inner))))
    }

    /// Apply a dump: release vanished sessions and admit new ones.
    #[instrument(name = "registry_update", skip_all, fields(sessions = dump.sessions.len()))]
    pub fn update(&self, dump: &SessionDump) {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            debug!("Registry destroyed, ignoring dump");
            return;
        }

        let mut changed = false;

        let removed: Vec<i32> = inner
            .sessions
            .keys()
            .filter(|id| !dump.sessions.contains_key(id))
            .copied()
            .collect();
        for session_id in removed {
            if let Some(active) = inner.sessions.remove(&session_id) {
                debug!(session_id, package = %active.info.package_name, "Session removed");
                inner.backend.release_session(&active.info, active.handle);
                changed = true;
            }
        }

        let mut added: Vec<(&i32, &SessionDumpEntry)> = dump
            .sessions
            .iter()
            .filter(|(id, _)| !inner.sessions.contains_key(id))
            .collect();
        added.sort_by_key(|(id, _)| **id);

        for (&session_id, entry) in added {
            if let Some(reason) = self.rejection(&inner.excluded_uids, session_id, entry) {
                trace!(session_id, ?reason, "Session not admitted");
                continue;
            }

            let info = SessionInfo::from_entry(session_id, entry);
            match inner.backend.create_session(&info) {
                Some(handle) => {
                    info!(session_id, package = %info.package_name, "Session added");
                    inner.sessions.insert(session_id, ActiveSession { info, handle });
                    changed = true;
                }
                None => {
                    warn!(session_id, package = %info.package_name, "App problem detected");
                    self.events.publish(RegistryEvent::AppProblem(info));
                }
            }
        }

        if changed {
            self.publish_changed(&inner);
        }
    }

    /// Replace the excluded uid set, evicting affected sessions before returning.
    #[instrument(name = "registry_set_excluded", skip_all)]
    pub fn set_excluded_uids(&self, uids: impl IntoIterator<Item = i32>) {
        let mut inner = self.inner.lock();
        inner.excluded_uids = uids.into_iter().collect();

        let evicted: Vec<i32> = inner
            .sessions
            .iter()
            .filter(|(_, s)| inner.excluded_uids.contains(&s.info.uid))
            .map(|(id, _)| *id)
            .collect();

        for session_id in &evicted {
            if let Some(active) = inner.sessions.remove(session_id) {
                debug!(session_id, uid = active.info.uid, "Evicting excluded session");
                inner.backend.release_session(&active.info, active.handle);
            }
        }

        if !evicted.is_empty() {
            self.publish_changed(&inner);
        }
    }

    /// Release every session.
    pub fn clear_sessions(&self) {
        let mut inner = self.inner.lock();
        if inner.sessions.is_empty() {
            return;
        }
        info!(count = inner.sessions.len(), "Clearing all sessions");
        let sessions: Vec<_> = inner.sessions.drain().map(|(_, s)| s).collect();
        for active in sessions {
            inner.backend.release_session(&active.info, active.handle);
        }
        self.publish_changed(&inner);
    }

    /// Release every session and ignore all further dumps.
    pub fn destroy(&self) {
        self.clear_sessions();
        self.inner.lock().destroyed = true;
    }

    /// Snapshot of the active sessions.
    pub fn sessions(&self) -> SessionMap {
        snapshot(&self.inner.lock())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().sessions.is_empty()
    }

    fn rejection(
        &self,
        excluded_uids: &HashSet<i32>,
        session_id: i32,
        entry: &SessionDumpEntry,
    ) -> Option<Rejection> {
        if session_id == 0 {
            Some(Rejection::DefaultSession)
        } else if entry.uid == self.own_uid || entry.package_name == self.own_package {
            Some(Rejection::OwnProcess)
        } else if excluded_uids.contains(&entry.uid) {
            Some(Rejection::ExcludedUid)
        } else if EXCLUDED_PACKAGES.contains(&entry.package_name.as_str()) {
            Some(Rejection::ProblemPackage)
        } else if !entry.is_usage_recordable() {
            Some(Rejection::NonRecordableUsage)
        } else {
            None
        }
    }

    // Published while the registry lock is held so no subscriber sees a partial diff.
    fn publish_changed(&self, inner: &RegistryInner<B>) {
        self.events
            .publish(RegistryEvent::Changed(Arc::new(snapshot(inner))));
    }
}

fn snapshot<B: SessionBackend>(inner: &RegistryInner<B>) -> SessionMap {
    inner
        .sessions
        .iter()
        .map(|(id, s)| (*id, s.info.clone()))
        .collect()
}

/// Backend muting every admitted session.
pub struct MutedSessionBackend {
    factory: MuteEffectFactory,
    on_loss: SessionLossCallback,
}

impl MutedSessionBackend {
    /// Session losses are published as [`RegistryEvent::SessionLost`] on `events`.
    pub fn new(factory: MuteEffectFactory, events: EventBus<RegistryEvent>) -> Self {
        let on_loss: SessionLossCallback = Arc::new(move |session| {
            events.publish(RegistryEvent::SessionLost(session));
        });
        Self { factory, on_loss }
    }
}

impl SessionBackend for MutedSessionBackend {
    type Handle = MuteEffect;

    fn create_session(&mut self, session: &SessionInfo) -> Option<MuteEffect> {
        self.factory.make(session, Arc::clone(&self.on_loss))
    }

    fn release_session(&mut self, _session: &SessionInfo, handle: MuteEffect) {
        handle.release();
    }
}
