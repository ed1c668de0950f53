//! Error types for the audio module.

use thiserror::Error;

/// Errors that can occur during audio operations.
#[derive(Debug, Error)]
pub enum AudioError {
    /// The host refused to hand out a capture authorization.
    #[error("Capture authorization denied: {0}")]
    AuthorizationDenied(String),

    /// The capture authorization was withdrawn.
    #[error("Capture authorization revoked")]
    AuthorizationRevoked,

    /// A capture or render device could not be built.
    #[error("Failed to build {device} device: {message}")]
    DeviceConstruction {
        device: &'static str,
        message: String,
    },

    /// A device refused to start.
    #[error("Failed to start {device} device: {message}")]
    DeviceStart {
        device: &'static str,
        message: String,
    },

    /// A single capture read failed.
    #[error("Capture read failed: {0}")]
    Read(String),

    /// A single render write failed.
    #[error("Render write failed: {0}")]
    Write(String),

    /// The worker thread could not be spawned.
    #[error("Failed to spawn capture thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

impl AudioError {
    /// Whether the loop can carry on after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Read(_) | Self::Write(_))
    }
}
