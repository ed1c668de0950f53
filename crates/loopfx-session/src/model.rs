//! Session dump and snapshot types.

use std::collections::{BTreeMap, HashMap};

use loopfx_ipc::SessionSummary;

/// Usage classifications whose output may be captured.
const RECORDABLE_USAGES: [&str; 3] = ["USAGE_UNKNOWN", "USAGE_MEDIA", "USAGE_GAME"];

/// Package name → capture allowed, as logged by the platform policy service.
pub type CapturePermissionLog = HashMap<String, bool>;

/// One session as reported by a platform dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDumpEntry {
    /// Owning uid.
    pub uid: i32,

    /// Owning package.
    pub package_name: String,

    /// Usage classification, e.g. `USAGE_MEDIA`.
    pub usage: String,

    /// Content type, e.g. `CONTENT_TYPE_MUSIC`.
    pub content: String,
}

impl SessionDumpEntry {
    /// Create a dump entry.
    pub fn new(uid: i32, package_name: impl Into<String>, usage: impl Into<String>) -> Self {
        Self {
            uid,
            package_name: package_name.into(),
            usage: usage.into(),
            content: String::from("CONTENT_TYPE_UNKNOWN"),
        }
    }

    /// Whether the usage classification allows capturing this session.
    pub fn is_usage_recordable(&self) -> bool {
        let usage = self.usage.trim().to_uppercase();
        RECORDABLE_USAGES.iter().any(|r| usage.contains(r))
    }
}

/// A snapshot of the platform's sessions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDump {
    /// Session id → session.
    pub sessions: HashMap<i32, SessionDumpEntry>,

    /// Capture allow/deny log, when the dump source carries one.
    pub capture_permission_log: Option<CapturePermissionLog>,
}

impl SessionDump {
    /// Create an empty dump.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session.
    pub fn with_session(mut self, session_id: i32, entry: SessionDumpEntry) -> Self {
        self.sessions.insert(session_id, entry);
        self
    }

    /// Attach a capture permission log.
    pub fn with_permission_log(mut self, log: CapturePermissionLog) -> Self {
        self.capture_permission_log = Some(log);
        self
    }
}

/// An admitted session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: i32,
    pub uid: i32,
    pub package_name: String,
    pub usage: String,
}

impl SessionInfo {
    pub fn from_entry(session_id: i32, entry: &SessionDumpEntry) -> Self {
        Self {
            session_id,
            uid: entry.uid,
            package_name: entry.package_name.clone(),
            usage: entry.usage.clone(),
        }
    }

    pub fn to_summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            uid: self.uid,
            package_name: self.package_name.clone(),
            usage: self.usage.clone(),
        }
    }
}

/// Session id → session, ordered for stable reporting.
pub type SessionMap = BTreeMap<i32, SessionInfo>;
