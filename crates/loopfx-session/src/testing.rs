//! In-memory hosts for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use loopfx_ipc::DumpMethod;

use crate::dump::SessionDumpProvider;
use crate::effect::{EffectHost, EffectInstance, EffectStatus, EffectType, MuteEffectKind, StatusHandler};
use crate::model::{CapturePermissionLog, SessionDump};
use crate::policy::PackageResolver;
use crate::{SessionError, SessionResult};

/// Effect instance recording everything done to it.
pub struct MockEffect {
    pub session_id: i32,
    pub effect_type: EffectType,
    enabled: AtomicBool,
    released: AtomicBool,
    fail_apply: AtomicBool,
    applied: Mutex<Vec<MuteEffectKind>>,
    handler: Mutex<Option<StatusHandler>>,
}

impl MockEffect {
    fn new(session_id: i32, effect_type: EffectType) -> Self {
        Self {
            session_id,
            effect_type,
            enabled: AtomicBool::new(false),
            released: AtomicBool::new(false),
            fail_apply: AtomicBool::new(false),
            applied: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> Vec<MuteEffectKind> {
        self.applied.lock().clone()
    }

    /// Make subsequent `apply` calls fail.
    pub fn fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    /// Disable the effect as another client would.
    pub fn force_disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Deliver a status change to the installed handler.
    pub fn fire(&self, status: EffectStatus) {
        if self.is_released() {
            return;
        }
        if let Some(handler) = self.handler.lock().as_ref() {
            handler(status);
        }
    }
}

impl EffectInstance for MockEffect {
    fn apply(&self, kind: &MuteEffectKind) -> SessionResult<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(SessionError::EffectConfiguration("rejected".into()));
        }
        self.applied.lock().push(*kind);
        Ok(())
    }

    fn set_enabled(&self, enabled: bool) -> SessionResult<()> {
        if self.is_released() {
            return Err(SessionError::ControlLost(self.session_id));
        }
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn set_status_handler(&self, handler: StatusHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.handler.lock().take();
    }
}

/// Effect host with configurable effect types.
pub struct MockEffectHost {
    available: Mutex<HashSet<EffectType>>,
    failing: Mutex<HashSet<EffectType>>,
    instances: Mutex<Vec<Arc<MockEffect>>>,
    closed: Mutex<Vec<(String, i32)>>,
}

impl MockEffectHost {
    /// A host offering every effect type.
    pub fn new() -> Self {
        Self::with_types(&[EffectType::DynamicsProcessing, EffectType::Volume])
    }

    /// A host offering only `types`.
    pub fn with_types(types: &[EffectType]) -> Self {
        Self {
            available: Mutex::new(types.iter().copied().collect()),
            failing: Mutex::new(HashSet::new()),
            instances: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
        }
    }

    /// Make creation of `effect` fail while still reporting it available.
    pub fn fail_creation_of(&self, effect: EffectType) {
        self.failing.lock().insert(effect);
    }

    /// Most recent instance created on a session.
    pub fn instance(&self, session_id: i32) -> Option<Arc<MockEffect>> {
        self.instances
            .lock()
            .iter()
            .rev()
            .find(|i| i.session_id == session_id)
            .cloned()
    }

    pub fn created_count(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn released_count(&self) -> usize {
        self.instances.lock().iter().filter(|i| i.is_released()).count()
    }

    pub fn closed_control_sessions(&self) -> Vec<(String, i32)> {
        self.closed.lock().clone()
    }
}

impl Default for MockEffectHost {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectHost for MockEffectHost {
    fn is_available(&self, effect: EffectType) -> bool {
        self.available.lock().contains(&effect)
    }

    fn create(
        &self,
        effect: EffectType,
        session_id: i32,
        _priority: i32,
    ) -> SessionResult<Arc<dyn EffectInstance>> {
        if self.failing.lock().contains(&effect) {
            return Err(SessionError::EffectCreation {
                session_id,
                message: "refused by host".into(),
            });
        }
        let instance = Arc::new(MockEffect::new(session_id, effect));
        self.instances.lock().push(Arc::clone(&instance));
        Ok(instance)
    }

    fn close_control_session(&self, package_name: &str, session_id: i32) {
        self.closed.lock().push((package_name.to_string(), session_id));
    }
}

/// Dump provider returning whatever was last stored.
pub struct StaticDumpProvider {
    method: DumpMethod,
    dump: Mutex<SessionResult<SessionDump>>,
    allowlist: Mutex<Option<CapturePermissionLog>>,
    allowlist_failing: AtomicBool,
    calls: AtomicUsize,
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl StaticDumpProvider {
    pub fn new(method: DumpMethod) -> Self {
        Self {
            method,
            dump: Mutex::new(Ok(SessionDump::new())),
            allowlist: Mutex::new(None),
            allowlist_failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            gate: Mutex::new(None),
        }
    }

    pub fn set_dump(&self, dump: SessionDump) {
        *self.dump.lock() = Ok(dump);
    }

    pub fn set_failing(&self) {
        *self.dump.lock() = Err(SessionError::DumpFailed {
            method: self.method,
            message: "service unavailable".into(),
        });
    }

    pub fn set_allowlist(&self, log: CapturePermissionLog) {
        *self.allowlist.lock() = Some(log);
    }

    /// Make the allowlist dump fail.
    pub fn set_allowlist_failing(&self) {
        self.allowlist_failing.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Block every dump until a message arrives on the returned sender.
    /// The returned receiver signals each dump entering the gate.
    pub fn gate(&self) -> (Sender<()>, Receiver<()>) {
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        *self.gate.lock() = Some((entered_tx, release_rx));
        (release_tx, entered_rx)
    }
}

impl SessionDumpProvider for StaticDumpProvider {
    fn method(&self) -> DumpMethod {
        self.method
    }

    fn dump_sessions(&self) -> SessionResult<SessionDump> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.recv();
        }
        match &*self.dump.lock() {
            Ok(dump) => Ok(dump.clone()),
            Err(_) => Err(SessionError::DumpFailed {
                method: self.method,
                message: "service unavailable".into(),
            }),
        }
    }

    fn dump_capture_allowlist_log(&self) -> SessionResult<Option<CapturePermissionLog>> {
        if self.allowlist_failing.load(Ordering::SeqCst) {
            return Err(SessionError::DumpFailed {
                method: self.method,
                message: "allowlist unavailable".into(),
            });
        }
        Ok(self.allowlist.lock().clone())
    }
}

/// Resolver backed by a fixed map.
#[derive(Default)]
pub struct MapResolver {
    uids: Mutex<HashMap<String, i32>>,
}

impl MapResolver {
    pub fn new(entries: &[(&str, i32)]) -> Self {
        Self {
            uids: Mutex::new(entries.iter().map(|(p, u)| (p.to_string(), *u)).collect()),
        }
    }

    pub fn insert(&self, package: &str, uid: i32) {
        self.uids.lock().insert(package.to_string(), uid);
    }
}

impl PackageResolver for MapResolver {
    fn uid_for_package(&self, package_name: &str) -> Option<i32> {
        self.uids.lock().get(package_name).copied()
    }
}
