//! Service state machine types.

use serde::{Deserialize, Serialize};

use crate::types::ServiceConfig;

/// The current state of the processor service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum ServiceState {
    /// Service is idle, nothing is captured.
    #[default]
    Idle,

    /// Service is starting up.
    Starting {
        /// Current startup phase.
        phase: StartupPhase,
    },

    /// Service is capturing and processing.
    Running {
        /// Active configuration.
        config: ServiceConfig,

        /// Number of muted sessions.
        sessions: usize,
    },

    /// Service is stopping.
    Stopping {
        /// Reason for stopping.
        reason: StopReason,
    },

    /// Service encountered a fatal error.
    Error {
        /// Error message.
        message: String,

        /// Whether recovery is possible.
        recoverable: bool,
    },
}

impl ServiceState {
    /// Returns true if the service is in the Idle state.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns true if the service is running.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Returns true if the service is starting.
    pub fn is_starting(&self) -> bool {
        matches!(self, Self::Starting { .. })
    }

    /// Returns true if the service is stopping.
    pub fn is_stopping(&self) -> bool {
        matches!(self, Self::Stopping { .. })
    }

    /// Returns true if the service is in an error state.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Starting { .. } => "Starting",
            Self::Running { .. } => "Running",
            Self::Stopping { .. } => "Stopping",
            Self::Error { .. } => "Error",
        }
    }
}

/// Startup phases for the service, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartupPhase {
    /// Obtaining the capture authorization.
    AcquireAuthorization,

    /// Setting the sample rate and pushing all DSP preferences.
    ConfigureEngine,

    /// Starting session discovery.
    TrackSessions,

    /// Building devices and starting the capture thread.
    StartPipeline,
}

impl StartupPhase {
    /// Returns the next phase, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::AcquireAuthorization => Some(Self::ConfigureEngine),
            Self::ConfigureEngine => Some(Self::TrackSessions),
            Self::TrackSessions => Some(Self::StartPipeline),
            Self::StartPipeline => None,
        }
    }

    /// Returns the previous phase, if any (for rollback).
    pub fn previous(self) -> Option<Self> {
        match self {
            Self::AcquireAuthorization => None,
            Self::ConfigureEngine => Some(Self::AcquireAuthorization),
            Self::TrackSessions => Some(Self::ConfigureEngine),
            Self::StartPipeline => Some(Self::TrackSessions),
        }
    }

    /// Returns the display name for this phase.
    pub fn name(self) -> &'static str {
        match self {
            Self::AcquireAuthorization => "Acquiring capture authorization",
            Self::ConfigureEngine => "Configuring engine",
            Self::TrackSessions => "Tracking sessions",
            Self::StartPipeline => "Starting pipeline",
        }
    }
}

/// Reason for stopping the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StopReason {
    /// User requested stop.
    UserRequested,

    /// Capture authorization was withdrawn.
    AuthorizationRevoked,

    /// An app kept control of its stream after all retries.
    SessionLost { uid: i32 },

    /// An app's session could not be muted.
    AppIncompatible { uid: i32 },

    /// The capture pipeline stopped itself.
    PipelineFailed { message: String },
}

impl StopReason {
    /// Returns a display message for this reason.
    pub fn message(&self) -> String {
        match self {
            Self::UserRequested => "Stopped by user".to_string(),
            Self::AuthorizationRevoked => "Capture authorization revoked".to_string(),
            Self::SessionLost { uid } => format!("Lost control of session owned by uid {uid}"),
            Self::AppIncompatible { uid } => format!("App with uid {uid} cannot be muted"),
            Self::PipelineFailed { message } => format!("Pipeline failed: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_phase_walk() {
        let mut phase = StartupPhase::AcquireAuthorization;
        let mut count = 1;
        while let Some(next) = phase.next() {
            assert_eq!(next.previous(), Some(phase));
            phase = next;
            count += 1;
        }
        assert_eq!(phase, StartupPhase::StartPipeline);
        assert_eq!(count, 4);
    }

    #[test]
    fn test_state_names() {
        assert!(ServiceState::default().is_idle());
        let running = ServiceState::Running {
            config: ServiceConfig::default(),
            sessions: 2,
        };
        assert!(running.is_running());
        assert_eq!(running.name(), "Running");
    }
}
