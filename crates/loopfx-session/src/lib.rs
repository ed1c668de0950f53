//! Per-app audio session tracking, muting and capture policy.
//!
//! Sessions reported by the platform are diffed into a registry, each
//! admitted session gets a mute effect so the captured copy is the only
//! one heard, and a policy tracker follows which packages forbid capture.

mod bus;
mod dump;
mod effect;
mod error;
mod model;
mod policy;
mod poller;
mod registry;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use bus::EventBus;
pub use dump::{DumpManager, SessionDumpProvider};
pub use effect::{
    EffectHost, EffectInstance, EffectStatus, EffectType, MuteEffect, MuteEffectFactory,
    MuteEffectKind, SessionLossCallback, StatusHandler, DYNAMICS_MUTE_GAIN_DB,
    VOLUME_MUTE_LEVEL_DB,
};
pub use error::SessionError;
pub use model::{CapturePermissionLog, SessionDump, SessionDumpEntry, SessionInfo, SessionMap};
pub use policy::{PackageResolver, PolicyDiff, PolicyEntry, PolicyUpdate, SessionPolicyTracker};
pub use poller::{HostNotification, SessionPoller, SessionSink, DEFAULT_POLLING_INTERVAL};
pub use registry::{
    MutedSessionBackend, Rejection, RegistryEvent, SessionBackend, SessionRegistry,
};

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Priority requested for mute effects; higher wins control of a session.
pub const EFFECT_PRIORITY: i32 = i32::MAX;

/// Uid used for packages whose uid could not be resolved.
pub const UNRESOLVED_UID: i32 = -1;

/// Packages that are never muted, besides the running process itself.
pub const EXCLUDED_PACKAGES: &[&str] = &[
    "com.google.android.googlequicksearchbox",
    "com.google.android.as",
    "com.kieronquinn.app.pixelambientmusic",
    "com.draftkings.sportsbook",
    "com.samsung.gpuwatchapp",
    "com.kalkiarts.hexabloompro",
];
