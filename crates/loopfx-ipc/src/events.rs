//! Events emitted by the processor service.

use serde::{Deserialize, Serialize};

use crate::state::ServiceState;
use crate::types::{PipelineStats, SessionSummary};

/// Events that the processor service emits to its controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceEvent {
    /// Service state has changed.
    StateChanged {
        /// Previous state.
        previous: Box<ServiceState>,

        /// Current state.
        current: Box<ServiceState>,
    },

    /// The set of muted sessions changed.
    SessionsChanged(Vec<SessionSummary>),

    /// An app took back control of its stream and retries were exhausted.
    SessionLost {
        uid: i32,
        package_name: String,
    },

    /// No mute effect could be attached to an app's session.
    AppProblemDetected {
        uid: i32,
        package_name: String,
    },

    /// The capture authorization was withdrawn.
    CaptureAuthorizationRevoked,

    /// Periodic pipeline counters.
    Stats(PipelineStats),

    /// Error occurred.
    Error {
        /// Whether the error is recoverable.
        recoverable: bool,

        /// Error message.
        message: String,
    },

    /// Service is ready to accept commands.
    Ready,

    /// Service has shut down.
    Shutdown,
}
