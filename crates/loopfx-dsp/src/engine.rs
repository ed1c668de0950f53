//! Interface of the native DSP engine.

use std::path::Path;

use tracing::{debug, info, warn};

/// A decoded impulse response.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpulseResponse {
    pub channels: usize,
    pub frames: usize,
    /// Interleaved samples.
    pub samples: Vec<f32>,
}

/// Native engine entry points. Setters return `false` when the engine rejects
/// the configuration.
pub trait NativeEngine: Send {
    fn set_sample_rate(&mut self, sample_rate: f32) -> bool;

    fn set_output_control(&mut self, threshold_db: f32, release_ms: f32, post_gain_db: f32) -> bool;

    fn set_compander(
        &mut self,
        enabled: bool,
        time_constant: f32,
        granularity: i32,
        tf_transforms: i32,
        response: &[f64],
    ) -> bool;

    fn set_bass_boost(&mut self, enabled: bool, max_gain_db: f32) -> bool;

    fn set_fir_equalizer(
        &mut self,
        enabled: bool,
        filter_type: i32,
        interpolation: i32,
        bands: &[f64],
    ) -> bool;

    fn set_graphic_eq(&mut self, enabled: bool, nodes: &str) -> bool;

    fn set_reverb(&mut self, enabled: bool, preset: i32) -> bool;

    fn set_stereo_enhancement(&mut self, enabled: bool, level: f32) -> bool;

    fn set_crossfeed(&mut self, enabled: bool, mode: i32) -> bool;

    fn set_vacuum_tube(&mut self, enabled: bool, drive: f32) -> bool;

    fn set_vdc(&mut self, enabled: bool, contents: &str) -> bool;

    fn set_liveprog(&mut self, enabled: bool, name: &str, script: &str) -> bool;

    fn set_convolver(
        &mut self,
        enabled: bool,
        impulse: Option<&ImpulseResponse>,
        advanced: &[i32; 6],
    ) -> bool;

    /// Decode an impulse response file, resampled to the current sample rate.
    fn read_impulse_response(&mut self, path: &Path, optimization_mode: i32) -> Option<ImpulseResponse>;

    fn process_i16(&mut self, input: &[i16], output: &mut [i16]);

    fn process_f32(&mut self, input: &[f32], output: &mut [f32]);

    /// Free the native handle. Called exactly once.
    fn free(&mut self);
}

/// Convolver problems reported through [`EngineCallbacks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvolverError {
    /// Advanced parameters were malformed; defaults were used.
    AdvancedParamsInvalid,
    /// The impulse response could not be decoded.
    Corrupted,
    /// The impulse response decoded to zero frames.
    NoFrames,
}

/// Diagnostics raised by the engine and the facade.
pub trait EngineCallbacks: Send + Sync {
    fn on_liveprog_output(&self, _line: &str) {}

    fn on_liveprog_exec(&self, _id: &str) {}

    fn on_liveprog_result(&self, _result: i32, _id: &str, _error: Option<&str>) {}

    fn on_vdc_parse_error(&self) {}

    fn on_convolver_error(&self, _error: ConvolverError) {}
}

/// Callbacks that only log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCallbacks;

impl EngineCallbacks for LoggingCallbacks {
    fn on_liveprog_output(&self, line: &str) {
        debug!(target: "liveprog", "{}", line);
    }

    fn on_liveprog_exec(&self, id: &str) {
        debug!(id, "Liveprog executing");
    }

    fn on_liveprog_result(&self, result: i32, id: &str, error: Option<&str>) {
        if result < 0 {
            warn!(result, id, error = error.unwrap_or(""), "Liveprog script failed");
        } else {
            info!(result, id, "Liveprog script loaded");
        }
    }

    fn on_vdc_parse_error(&self) {
        warn!("DDC file could not be parsed");
    }

    fn on_convolver_error(&self, error: ConvolverError) {
        warn!(?error, "Convolver problem");
    }
}
