//! Error types for the processor service.

use thiserror::Error;

use loopfx_audio::AudioError;
use loopfx_dsp::DspError;
use loopfx_session::SessionError;

/// Errors that can occur while running the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Device or authorization failure.
    #[error(transparent)]
    Audio(#[from] AudioError),

    /// Session tracking failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Engine configuration failure.
    #[error(transparent)]
    Dsp(#[from] DspError),

    /// The background runtime could not be built.
    #[error("Failed to build runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// A startup phase found a resource it needs missing.
    #[error("{0} not initialized")]
    MissingResource(&'static str),
}
