//! Feeds platform dumps into the policy tracker and the registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use loopfx_ipc::{DumpMethod, SessionUpdateMode};

use crate::dump::DumpManager;
use crate::model::SessionDump;
use crate::policy::SessionPolicyTracker;
use crate::registry::{SessionBackend, SessionRegistry};
use crate::SessionResult;

/// Default interval between polls in continuous mode.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(3000);

/// Anything that consumes session dumps.
pub trait SessionSink: Send + Sync {
    fn update(&self, dump: &SessionDump);
    fn clear_sessions(&self);
}

impl<B: SessionBackend> SessionSink for SessionRegistry<B> {
    fn update(&self, dump: &SessionDump) {
        SessionRegistry::update(self, dump);
    }

    fn clear_sessions(&self) {
        SessionRegistry::clear_sessions(self);
    }
}

/// Host events that may mean the set of sessions changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostNotification {
    /// Playback configuration of some stream changed.
    PlaybackConfigChanged,

    /// An app opened an effect control session.
    ControlSessionOpened { package_name: String, session_id: i32 },

    /// An app closed an effect control session.
    ControlSessionClosed { package_name: String, session_id: i32 },

    /// The set of media sessions changed.
    MediaSessionsChanged,
}

struct PollTarget {
    dumps: Arc<DumpManager>,
    sessions: Arc<dyn SessionSink>,
    policy: Arc<SessionPolicyTracker>,
    lock: Mutex<()>,
}

impl PollTarget {
    fn poll_blocking(&self) {
        let _guard = self.lock.lock();
        self.poll_locked();
    }

    fn try_poll(&self) -> bool {
        match self.lock.try_lock() {
            Some(_guard) => {
                self.poll_locked();
                true
            }
            None => false,
        }
    }

    fn poll_locked(&self) {
        let dump = match self.dumps.dump_sessions() {
            Ok(dump) => dump,
            Err(e) => {
                warn!("Session poll failed: {}", e);
                return;
            }
        };

        match &dump.capture_permission_log {
            Some(log) => {
                self.policy.update(log);
            }
            None => match self.dumps.dump_capture_allowlist_log() {
                Ok(Some(log)) => {
                    self.policy.update(&log);
                }
                Ok(None) => {}
                Err(e) => debug!("Allowlist dump failed: {}", e),
            },
        }

        self.sessions.update(&dump);
    }
}

/// Decides when dumps are taken.
pub struct SessionPoller {
    target: Arc<PollTarget>,
    runtime: Handle,
    active: AtomicBool,
    mode: Mutex<SessionUpdateMode>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionPoller {
    /// Create an inactive poller. Background work runs on `runtime`.
    pub fn new(
        dumps: Arc<DumpManager>,
        sessions: Arc<dyn SessionSink>,
        policy: Arc<SessionPolicyTracker>,
        runtime: Handle,
    ) -> Self {
        Self {
            target: Arc::new(PollTarget {
                dumps,
                sessions,
                policy,
                lock: Mutex::new(()),
            }),
            runtime,
            active: AtomicBool::new(false),
            mode: Mutex::new(SessionUpdateMode::Listener),
            task: Mutex::new(None),
        }
    }

    /// Start reacting to notifications or polling, depending on `mode`.
    pub fn start(&self, mode: SessionUpdateMode, interval: Duration) {
        self.active.store(true, Ordering::SeqCst);
        self.set_mode(mode, interval);
    }

    /// Stop all background polling. Notifications are ignored afterwards.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> SessionUpdateMode {
        *self.mode.lock()
    }

    /// Switch modes, restarting the polling task as needed.
    pub fn set_mode(&self, mode: SessionUpdateMode, interval: Duration) {
        *self.mode.lock() = mode;

        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
        }
        if !self.is_active() {
            return;
        }

        info!(?mode, ?interval, "Session update mode");
        if mode == SessionUpdateMode::ContinuousPolling {
            let target = Arc::clone(&self.target);
            *task = Some(self.runtime.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let target = Arc::clone(&target);
                    match tokio::task::spawn_blocking(move || target.try_poll()).await {
                        Ok(true) => {}
                        Ok(false) => trace!("Poll already in flight, skipping tick"),
                        Err(e) => warn!("Poll task failed: {}", e),
                    }
                }
            }));
        }
    }

    /// Poll on the calling thread, waiting for any poll in flight.
    pub fn poll_blocking(&self) {
        self.target.poll_blocking();
    }

    /// Poll on the calling thread unless a poll is already in flight.
    pub fn try_poll(&self) -> bool {
        self.target.try_poll()
    }

    /// Poll on the runtime. Dropped if another poll is in flight.
    pub fn poll_in_background(&self) {
        if !self.is_active() {
            return;
        }
        let target = Arc::clone(&self.target);
        self.runtime.spawn_blocking(move || {
            if !target.try_poll() {
                trace!("Poll already in flight, dropping request");
            }
        });
    }

    /// React to a host notification in listener mode.
    pub fn on_host_notification(&self, notification: HostNotification) {
        if !self.is_active() || self.mode() != SessionUpdateMode::Listener {
            return;
        }
        match &notification {
            HostNotification::ControlSessionOpened { session_id, .. }
            | HostNotification::ControlSessionClosed { session_id, .. }
                if *session_id < 0 =>
            {
                trace!(?notification, "Ignoring control session without id");
            }
            _ => self.poll_in_background(),
        }
    }

    /// Switch dump source. Known sessions and policy are dropped and re-read.
    pub fn change_dump_method(&self, method: DumpMethod) -> SessionResult<()> {
        if self.target.dumps.set_active_method(method)? {
            self.target.sessions.clear_sessions();
            self.target.policy.clear();
            self.poll_blocking();
        }
        Ok(())
    }
}

impl Drop for SessionPoller {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::bus::EventBus;
    use crate::dump::SessionDumpProvider;
    use crate::effect::MuteEffectFactory;
    use crate::model::SessionDumpEntry;
    use crate::registry::MutedSessionBackend;
    use crate::testing::{MapResolver, MockEffectHost, StaticDumpProvider};

    struct Fixture {
        runtime: tokio::runtime::Runtime,
        primary: Arc<StaticDumpProvider>,
        secondary: Arc<StaticDumpProvider>,
        registry: Arc<SessionRegistry<MutedSessionBackend>>,
        policy: Arc<SessionPolicyTracker>,
        poller: Arc<SessionPoller>,
    }

    fn fixture() -> Fixture {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let primary = Arc::new(StaticDumpProvider::new(DumpMethod::AudioPolicyService));
        let secondary = Arc::new(StaticDumpProvider::new(DumpMethod::AudioService));
        let dumps = Arc::new(DumpManager::new(
            vec![
                primary.clone() as Arc<dyn SessionDumpProvider>,
                secondary.clone() as Arc<dyn SessionDumpProvider>,
            ],
            DumpMethod::AudioPolicyService,
        ));
        dumps.set_allow_fallback(false);

        let events = EventBus::new();
        let backend = MutedSessionBackend::new(
            MuteEffectFactory::new(Arc::new(MockEffectHost::new())),
            events.clone(),
        );
        let registry = Arc::new(SessionRegistry::new(10001, "me.loopfx", backend, events));
        let policy = Arc::new(SessionPolicyTracker::new(
            "me.loopfx",
            Arc::new(MapResolver::new(&[("com.x", 100)])),
        ));
        let poller = Arc::new(SessionPoller::new(
            dumps,
            registry.clone(),
            policy.clone(),
            runtime.handle().clone(),
        ));

        Fixture {
            runtime,
            primary,
            secondary,
            registry,
            policy,
            poller,
        }
    }

    fn media_dump() -> SessionDump {
        SessionDump::new().with_session(5, SessionDumpEntry::new(100, "com.x", "USAGE_MEDIA"))
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_poll_updates_policy_then_registry() {
        let f = fixture();
        let mut log = std::collections::HashMap::new();
        log.insert("com.x".to_string(), false);
        f.primary.set_dump(media_dump().with_permission_log(log));

        f.poller.poll_blocking();

        assert_eq!(f.policy.restricted_uids(), vec![100]);
        assert_eq!(f.registry.len(), 1);
    }

    #[test]
    fn test_poll_uses_separate_allowlist_dump() {
        let f = fixture();
        let mut log = std::collections::HashMap::new();
        log.insert("com.x".to_string(), false);
        f.primary.set_dump(media_dump());
        f.secondary.set_allowlist(log);

        f.poller.poll_blocking();

        assert_eq!(f.policy.restricted_uids(), vec![100]);
    }

    #[test]
    fn test_background_poll_requires_active() {
        let f = fixture();
        f.primary.set_dump(media_dump());

        f.poller.poll_in_background();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(f.primary.calls(), 0);

        f.poller.start(SessionUpdateMode::Listener, DEFAULT_POLLING_INTERVAL);
        f.poller.poll_in_background();
        assert!(wait_for(|| f.registry.len() == 1));
    }

    #[test]
    fn test_concurrent_non_blocking_poll_is_dropped() {
        let f = fixture();
        let (release, entered) = f.primary.gate();

        let poller = Arc::clone(&f.poller);
        let blocked = thread::spawn(move || poller.poll_blocking());
        entered.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(!f.poller.try_poll());
        assert_eq!(f.primary.calls(), 1);

        release.send(()).unwrap();
        blocked.join().unwrap();
    }

    #[test]
    fn test_continuous_polling() {
        let f = fixture();
        f.primary.set_dump(media_dump());

        f.poller
            .start(SessionUpdateMode::ContinuousPolling, Duration::from_millis(20));
        assert!(wait_for(|| f.primary.calls() >= 3));

        f.poller.stop();
        thread::sleep(Duration::from_millis(50));
        let calls = f.primary.calls();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(f.primary.calls(), calls);
    }

    #[test]
    fn test_notifications_ignored_in_continuous_mode() {
        let f = fixture();
        f.poller
            .start(SessionUpdateMode::ContinuousPolling, Duration::from_secs(3600));
        // The first tick fires immediately.
        assert!(wait_for(|| f.primary.calls() == 1));

        f.poller.on_host_notification(HostNotification::PlaybackConfigChanged);
        thread::sleep(Duration::from_millis(50));

        assert_eq!(f.primary.calls(), 1);
    }

    #[test]
    fn test_control_session_without_id_is_ignored() {
        let f = fixture();
        f.poller.start(SessionUpdateMode::Listener, DEFAULT_POLLING_INTERVAL);

        f.poller.on_host_notification(HostNotification::ControlSessionOpened {
            package_name: "com.x".into(),
            session_id: -1,
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(f.primary.calls(), 0);

        f.poller.on_host_notification(HostNotification::ControlSessionOpened {
            package_name: "com.x".into(),
            session_id: 5,
        });
        assert!(wait_for(|| f.primary.calls() == 1));
    }

    #[test]
    fn test_dump_method_change_resets_and_repolls() {
        let f = fixture();
        f.primary.set_dump(media_dump());
        f.poller.poll_blocking();
        assert_eq!(f.registry.len(), 1);

        f.secondary.set_dump(
            SessionDump::new().with_session(9, SessionDumpEntry::new(101, "com.y", "USAGE_GAME")),
        );
        f.poller.change_dump_method(DumpMethod::AudioService).unwrap();

        let ids: Vec<i32> = f.registry.sessions().keys().copied().collect();
        assert_eq!(ids, vec![9]);
    }
}
