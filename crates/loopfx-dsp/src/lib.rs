//! Preference-driven facade over the native DSP engine.
//!
//! The engine itself is opaque: it exposes one setter per effect stage and
//! a buffer transform. This crate caches preference reads per namespace so
//! a sync only touches the stages whose settings changed.

mod cache;
mod engine;
mod error;
mod facade;
mod prefs;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use cache::{PreferenceCache, PreferenceRead, DIAGNOSTICS_CHANNEL_CAPACITY};
pub use engine::{ConvolverError, EngineCallbacks, ImpulseResponse, LoggingCallbacks, NativeEngine};
pub use error::DspError;
pub use facade::{
    BassSettings, CompanderSettings, ConvolverSettings, EngineFacade, EqualizerSettings, FileStage,
    GraphicEqSettings, Namespace, OutputSettings, SimpleStage, SyncReport, COMPANDER_RESPONSE_COUNT,
    DEFAULT_COMPANDER_RESPONSE, DEFAULT_CONVOLVER_ADVANCED, DEFAULT_EQ_BANDS, DEFAULT_GRAPHIC_EQ,
    EQ_BAND_COUNT,
};
pub use prefs::{MemoryPreferences, PrefType, PrefValue, PreferenceStore};

/// Result type for DSP operations.
pub type DspResult<T> = Result<T, DspError>;
