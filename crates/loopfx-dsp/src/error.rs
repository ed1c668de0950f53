//! Error types for the DSP facade.

use thiserror::Error;

/// Errors that can occur while configuring the engine.
#[derive(Debug, Error)]
pub enum DspError {
    /// A user-controlled setting failed validation. The stage keeps its previous state.
    #[error("Malformed {stage} configuration: {reason}")]
    MalformedConfiguration { stage: &'static str, reason: String },

    /// The engine refused a setter call.
    #[error("Engine rejected {0} configuration")]
    StageRejected(&'static str),

    /// The native engine could not be allocated.
    #[error("Failed to allocate engine: {0}")]
    Allocation(String),

    /// The engine handle was already freed.
    #[error("Engine already released")]
    EngineReleased,

    /// Reading a file-backed setting failed.
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Preferences could not be parsed.
    #[error("Invalid preferences: {0}")]
    Preferences(#[from] serde_json::Error),
}

impl DspError {
    pub(crate) fn malformed(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedConfiguration {
            stage,
            reason: reason.into(),
        }
    }
}
