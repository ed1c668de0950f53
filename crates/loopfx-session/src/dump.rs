//! Platform session dumps with method selection and fallback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use loopfx_ipc::DumpMethod;

use crate::model::{CapturePermissionLog, SessionDump};
use crate::{SessionError, SessionResult};

/// A platform service able to list active sessions.
pub trait SessionDumpProvider: Send + Sync {
    /// Which method this provider implements.
    fn method(&self) -> DumpMethod;

    /// List active sessions.
    fn dump_sessions(&self) -> SessionResult<SessionDump>;

    /// Capture allow/deny log, for providers that expose it separately.
    fn dump_capture_allowlist_log(&self) -> SessionResult<Option<CapturePermissionLog>> {
        Ok(None)
    }
}

/// Routes dump requests to the active provider.
pub struct DumpManager {
    providers: Vec<Arc<dyn SessionDumpProvider>>,
    active: RwLock<DumpMethod>,
    allow_fallback: AtomicBool,
}

impl DumpManager {
    /// Providers are tried in the given order when falling back.
    pub fn new(providers: Vec<Arc<dyn SessionDumpProvider>>, active: DumpMethod) -> Self {
        Self {
            providers,
            active: RwLock::new(active),
            allow_fallback: AtomicBool::new(true),
        }
    }

    pub fn active_method(&self) -> DumpMethod {
        *self.active.read()
    }

    /// Select the active method. Returns whether it changed.
    pub fn set_active_method(&self, method: DumpMethod) -> SessionResult<bool> {
        if self.provider(method).is_none() {
            return Err(SessionError::NoDumpProvider(method));
        }
        let mut active = self.active.write();
        if *active == method {
            return Ok(false);
        }
        info!(from = ?*active, to = ?method, "Dump method changed");
        *active = method;
        Ok(true)
    }

    pub fn set_allow_fallback(&self, allow: bool) {
        self.allow_fallback.store(allow, Ordering::SeqCst);
    }

    /// Dump sessions using the active method.
    ///
    /// If that fails or reports nothing and fallback is allowed, the other
    /// providers are tried in order and the first non-empty dump wins.
    pub fn dump_sessions(&self) -> SessionResult<SessionDump> {
        let method = self.active_method();
        let primary = match self.provider(method) {
            Some(provider) => provider.dump_sessions(),
            None => Err(SessionError::NoDumpProvider(method)),
        };

        let needs_fallback = match &primary {
            Ok(dump) => dump.sessions.is_empty(),
            Err(e) => {
                warn!(?method, "Session dump failed: {}", e);
                true
            }
        };
        if !needs_fallback || !self.allow_fallback.load(Ordering::SeqCst) {
            return primary;
        }

        for provider in self.providers.iter().filter(|p| p.method() != method) {
            match provider.dump_sessions() {
                Ok(dump) if !dump.sessions.is_empty() => {
                    debug!(method = ?provider.method(), "Using fallback dump");
                    return Ok(dump);
                }
                Ok(_) => {}
                Err(e) => debug!(method = ?provider.method(), "Fallback dump failed: {}", e),
            }
        }

        primary
    }

    /// First capture allow/deny log offered by any provider.
    ///
    /// Failing providers are skipped. The first error is returned only when
    /// every provider failed.
    pub fn dump_capture_allowlist_log(&self) -> SessionResult<Option<CapturePermissionLog>> {
        let mut first_error = None;
        let mut any_answered = false;
        for provider in &self.providers {
            match provider.dump_capture_allowlist_log() {
                Ok(Some(log)) => return Ok(Some(log)),
                Ok(None) => any_answered = true,
                Err(e) => {
                    warn!(method = ?provider.method(), "Allowlist dump failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if !any_answered => Err(e),
            _ => Ok(None),
        }
    }

    fn provider(&self, method: DumpMethod) -> Option<&Arc<dyn SessionDumpProvider>> {
        self.providers.iter().find(|p| p.method() == method)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::model::SessionDumpEntry;
    use crate::testing::StaticDumpProvider;

    fn providers() -> (Arc<StaticDumpProvider>, Arc<StaticDumpProvider>, DumpManager) {
        let policy = Arc::new(StaticDumpProvider::new(DumpMethod::AudioPolicyService));
        let service = Arc::new(StaticDumpProvider::new(DumpMethod::AudioService));
        let manager = DumpManager::new(
            vec![
                policy.clone() as Arc<dyn SessionDumpProvider>,
                service.clone() as Arc<dyn SessionDumpProvider>,
            ],
            DumpMethod::AudioPolicyService,
        );
        (policy, service, manager)
    }

    fn one_session() -> SessionDump {
        SessionDump::new().with_session(5, SessionDumpEntry::new(100, "com.x", "USAGE_MEDIA"))
    }

    #[test]
    fn test_uses_active_method() {
        let (policy, service, manager) = providers();
        policy.set_dump(one_session());

        assert_eq!(manager.dump_sessions().unwrap().sessions.len(), 1);
        assert_eq!(service.calls(), 0);
    }

    #[test]
    fn test_falls_back_on_failure() {
        let (policy, service, manager) = providers();
        policy.set_failing();
        service.set_dump(one_session());

        assert_eq!(manager.dump_sessions().unwrap().sessions.len(), 1);
    }

    #[test]
    fn test_falls_back_on_empty_dump() {
        let (_policy, service, manager) = providers();
        service.set_dump(one_session());

        assert_eq!(manager.dump_sessions().unwrap().sessions.len(), 1);
    }

    #[test]
    fn test_no_fallback_when_disabled() {
        let (policy, service, manager) = providers();
        manager.set_allow_fallback(false);
        policy.set_failing();
        service.set_dump(one_session());

        assert!(manager.dump_sessions().is_err());
        assert_eq!(service.calls(), 0);
    }

    #[test]
    fn test_set_active_method() {
        let (_policy, _service, manager) = providers();

        assert!(manager.set_active_method(DumpMethod::AudioService).unwrap());
        assert!(!manager.set_active_method(DumpMethod::AudioService).unwrap());
        assert_eq!(manager.active_method(), DumpMethod::AudioService);
    }

    #[test]
    fn test_unknown_method_is_rejected() {
        let policy = Arc::new(StaticDumpProvider::new(DumpMethod::AudioPolicyService));
        let manager = DumpManager::new(
            vec![policy as Arc<dyn SessionDumpProvider>],
            DumpMethod::AudioPolicyService,
        );

        assert!(matches!(
            manager.set_active_method(DumpMethod::AudioService),
            Err(SessionError::NoDumpProvider(DumpMethod::AudioService))
        ));
    }

    #[test]
    fn test_allowlist_skips_failing_provider() {
        let (policy, service, manager) = providers();
        policy.set_allowlist_failing();
        service.set_allowlist(HashMap::from([("com.secret".to_string(), false)]));

        let log = manager.dump_capture_allowlist_log().unwrap();
        assert_eq!(log, Some(HashMap::from([("com.secret".to_string(), false)])));
    }

    #[test]
    fn test_allowlist_error_when_every_provider_fails() {
        let (policy, service, manager) = providers();
        policy.set_allowlist_failing();
        service.set_allowlist_failing();
        assert!(manager.dump_capture_allowlist_log().is_err());

        let (policy, _service, manager) = providers();
        policy.set_allowlist_failing();
        assert_eq!(manager.dump_capture_allowlist_log().unwrap(), None);
    }
}
