//! In-memory engine and callbacks for tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::{ConvolverError, EngineCallbacks, ImpulseResponse, NativeEngine};

/// Everything a [`MockEngine`] was told.
#[derive(Debug, Default)]
pub struct MockEngineState {
    pub sample_rate: Option<f32>,
    /// (threshold, release, post gain)
    pub output: Option<(f32, f32, f32)>,
    pub compander_response: Option<Vec<f64>>,
    pub bass_gain: Option<f32>,
    pub equalizer_bands: Option<Vec<f64>>,
    pub graphic_eq: Option<String>,
    pub vdc: Option<String>,
    /// (name, script)
    pub liveprog: Option<(String, String)>,
    pub convolver_advanced: Option<[i32; 6]>,
    pub convolver_frames: Option<usize>,
    /// Last enabled flag per stage.
    pub stages: HashMap<&'static str, bool>,
    /// Setter calls in order.
    pub calls: Vec<&'static str>,
    /// Stages whose setters return `false`.
    pub reject: HashSet<&'static str>,
    /// Frames of the impulse response to decode; `None` fails decoding.
    pub impulse_frames: Option<usize>,
    pub processed_samples: usize,
    pub freed: usize,
}

impl MockEngineState {
    fn record(&mut self, stage: &'static str, enabled: bool) -> bool {
        self.calls.push(stage);
        if self.reject.contains(stage) {
            return false;
        }
        self.stages.insert(stage, enabled);
        true
    }
}

/// Engine that records setter calls and halves every sample.
pub struct MockEngine {
    state: Arc<Mutex<MockEngineState>>,
}

impl MockEngine {
    pub fn new() -> (Self, Arc<Mutex<MockEngineState>>) {
        let state = Arc::new(Mutex::new(MockEngineState::default()));
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

impl NativeEngine for MockEngine {
    fn set_sample_rate(&mut self, sample_rate: f32) -> bool {
        self.state.lock().sample_rate = Some(sample_rate);
        true
    }

    fn set_output_control(&mut self, threshold_db: f32, release_ms: f32, post_gain_db: f32) -> bool {
        let mut state = self.state.lock();
        if !state.record("output", true) {
            return false;
        }
        state.output = Some((threshold_db, release_ms, post_gain_db));
        true
    }

    fn set_compander(
        &mut self,
        enabled: bool,
        _time_constant: f32,
        _granularity: i32,
        _tf_transforms: i32,
        response: &[f64],
    ) -> bool {
        let mut state = self.state.lock();
        if !state.record("compander", enabled) {
            return false;
        }
        state.compander_response = Some(response.to_vec());
        true
    }

    fn set_bass_boost(&mut self, enabled: bool, max_gain_db: f32) -> bool {
        let mut state = self.state.lock();
        if !state.record("bass", enabled) {
            return false;
        }
        state.bass_gain = Some(max_gain_db);
        true
    }

    fn set_fir_equalizer(
        &mut self,
        enabled: bool,
        _filter_type: i32,
        _interpolation: i32,
        bands: &[f64],
    ) -> bool {
        let mut state = self.state.lock();
        if !state.record("equalizer", enabled) {
            return false;
        }
        state.equalizer_bands = Some(bands.to_vec());
        true
    }

    fn set_graphic_eq(&mut self, enabled: bool, nodes: &str) -> bool {
        let mut state = self.state.lock();
        if !state.record("graphic_eq", enabled) {
            return false;
        }
        state.graphic_eq = Some(nodes.to_string());
        true
    }

    fn set_reverb(&mut self, enabled: bool, _preset: i32) -> bool {
        self.state.lock().record("reverb", enabled)
    }

    fn set_stereo_enhancement(&mut self, enabled: bool, _level: f32) -> bool {
        self.state.lock().record("stereo_wide", enabled)
    }

    fn set_crossfeed(&mut self, enabled: bool, _mode: i32) -> bool {
        self.state.lock().record("crossfeed", enabled)
    }

    fn set_vacuum_tube(&mut self, enabled: bool, _drive: f32) -> bool {
        self.state.lock().record("tube", enabled)
    }

    fn set_vdc(&mut self, enabled: bool, contents: &str) -> bool {
        let mut state = self.state.lock();
        if !state.record("ddc", enabled) {
            return false;
        }
        if enabled {
            state.vdc = Some(contents.to_string());
        }
        true
    }

    fn set_liveprog(&mut self, enabled: bool, name: &str, script: &str) -> bool {
        let mut state = self.state.lock();
        if !state.record("liveprog", enabled) {
            return false;
        }
        if enabled {
            state.liveprog = Some((name.to_string(), script.to_string()));
        }
        true
    }

    fn set_convolver(
        &mut self,
        enabled: bool,
        impulse: Option<&ImpulseResponse>,
        advanced: &[i32; 6],
    ) -> bool {
        let mut state = self.state.lock();
        if !state.record("convolver", enabled) {
            return false;
        }
        state.convolver_advanced = Some(*advanced);
        state.convolver_frames = impulse.map(|ir| ir.frames);
        true
    }

    fn read_impulse_response(&mut self, _path: &Path, _optimization_mode: i32) -> Option<ImpulseResponse> {
        self.state.lock().impulse_frames.map(|frames| ImpulseResponse {
            channels: 2,
            frames,
            samples: vec![0.0; frames * 2],
        })
    }

    fn process_i16(&mut self, input: &[i16], output: &mut [i16]) {
        for (out, sample) in output.iter_mut().zip(input) {
            *out = sample / 2;
        }
        self.state.lock().processed_samples += input.len();
    }

    fn process_f32(&mut self, input: &[f32], output: &mut [f32]) {
        for (out, sample) in output.iter_mut().zip(input) {
            *out = sample * 0.5;
        }
        self.state.lock().processed_samples += input.len();
    }

    fn free(&mut self) {
        self.state.lock().freed += 1;
    }
}

/// Callbacks that remember what they were told.
#[derive(Default)]
pub struct RecordingCallbacks {
    convolver: Mutex<Vec<ConvolverError>>,
    vdc_errors: AtomicUsize,
}

impl RecordingCallbacks {
    pub fn convolver_errors(&self) -> Vec<ConvolverError> {
        self.convolver.lock().clone()
    }

    pub fn vdc_errors(&self) -> usize {
        self.vdc_errors.load(Ordering::SeqCst)
    }
}

impl EngineCallbacks for RecordingCallbacks {
    fn on_vdc_parse_error(&self) {
        self.vdc_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_convolver_error(&self, error: ConvolverError) {
        self.convolver.lock().push(error);
    }
}
