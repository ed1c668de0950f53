//! Error types for session tracking.

use thiserror::Error;

use loopfx_ipc::DumpMethod;

/// Errors that can occur while tracking or muting sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The host does not offer this effect type.
    #[error("Effect type not available: {0}")]
    EffectUnavailable(&'static str),

    /// The host refused to create an effect on the session.
    #[error("Failed to create effect on session {session_id}: {message}")]
    EffectCreation { session_id: i32, message: String },

    /// Setting effect parameters failed.
    #[error("Failed to configure effect: {0}")]
    EffectConfiguration(String),

    /// Another client holds control of the effect.
    #[error("Effect control lost on session {0}")]
    ControlLost(i32),

    /// A platform dump could not be taken.
    #[error("Dump via {method:?} failed: {message}")]
    DumpFailed { method: DumpMethod, message: String },

    /// No provider is registered for a dump method.
    #[error("No dump provider for {0:?}")]
    NoDumpProvider(DumpMethod),
}
