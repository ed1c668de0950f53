//! Engine facade: per-stage setters and preference sync.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::cache::{PreferenceCache, PreferenceRead};
use crate::engine::{ConvolverError, EngineCallbacks, NativeEngine};
use crate::prefs::PreferenceStore;
use crate::{DspError, DspResult};

/// Number of values in an equalizer band string: 15 frequencies then 15 gains.
pub const EQ_BAND_COUNT: usize = 30;

/// Number of values in a compander response string.
pub const COMPANDER_RESPONSE_COUNT: usize = 14;

pub const DEFAULT_EQ_BANDS: &str = "25.0;40.0;63.0;100.0;160.0;250.0;400.0;630.0;1000.0;1600.0;\
2500.0;4000.0;6300.0;10000.0;16000.0;0;0;0;0;0;0;0;0;0;0;0;0;0;0;0";

pub const DEFAULT_COMPANDER_RESPONSE: &str = "95.0;200.0;400.0;800.0;1600.0;3400.0;7500.0;0;0;0;0;0;0;0";

pub const DEFAULT_GRAPHIC_EQ: &str = "GraphicEQ: 0.0 0.0;";

pub const DEFAULT_CONVOLVER_ADVANCED: [i32; 6] = [-80, -100, 0, 0, 0, 0];

const GRAPHIC_EQ_HEADER: &str = "graphiceq:";

/// Preference namespaces, one per engine stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Output,
    Compander,
    Bass,
    Equalizer,
    GraphicEq,
    Reverb,
    StereoWide,
    Crossfeed,
    Tube,
    Ddc,
    Liveprog,
    Convolver,
}

impl Namespace {
    pub const ALL: [Namespace; 12] = [
        Namespace::Output,
        Namespace::Compander,
        Namespace::Bass,
        Namespace::Equalizer,
        Namespace::GraphicEq,
        Namespace::Reverb,
        Namespace::StereoWide,
        Namespace::Crossfeed,
        Namespace::Tube,
        Namespace::Ddc,
        Namespace::Liveprog,
        Namespace::Convolver,
    ];

    /// Preference namespace key.
    pub fn key(self) -> &'static str {
        match self {
            Self::Output => "dsp_output_control",
            Self::Compander => "dsp_compander",
            Self::Bass => "dsp_bass",
            Self::Equalizer => "dsp_equalizer",
            Self::GraphicEq => "dsp_graphiceq",
            Self::Reverb => "dsp_reverb",
            Self::StereoWide => "dsp_stereowide",
            Self::Crossfeed => "dsp_crossfeed",
            Self::Tube => "dsp_tube",
            Self::Ddc => "dsp_ddc",
            Self::Liveprog => "dsp_liveprog",
            Self::Convolver => "dsp_convolver",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ns| ns.key() == key)
    }

    /// Stage name used in errors.
    pub fn stage(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Compander => "compander",
            Self::Bass => "bass",
            Self::Equalizer => "equalizer",
            Self::GraphicEq => "graphic equalizer",
            Self::Reverb => "reverb",
            Self::StereoWide => "stereo wide",
            Self::Crossfeed => "crossfeed",
            Self::Tube => "tube",
            Self::Ddc => "ddc",
            Self::Liveprog => "liveprog",
            Self::Convolver => "convolver",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputSettings {
    pub master_enable: bool,
    pub post_gain_db: f32,
    pub limiter_threshold_db: f32,
    pub limiter_release_ms: f32,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            master_enable: true,
            post_gain_db: 0.0,
            limiter_threshold_db: -0.1,
            limiter_release_ms: 60.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompanderSettings {
    pub enabled: bool,
    pub time_constant: f32,
    pub granularity: i32,
    pub tf_transforms: i32,
    pub response: String,
}

impl Default for CompanderSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            time_constant: 0.22,
            granularity: 2,
            tf_transforms: 0,
            response: DEFAULT_COMPANDER_RESPONSE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BassSettings {
    pub enabled: bool,
    pub max_gain_db: f32,
}

impl Default for BassSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_gain_db: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EqualizerSettings {
    pub enabled: bool,
    pub filter_type: i32,
    pub interpolation: i32,
    pub bands: String,
}

impl Default for EqualizerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            filter_type: 0,
            interpolation: 0,
            bands: DEFAULT_EQ_BANDS.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphicEqSettings {
    pub enabled: bool,
    pub nodes: String,
}

impl Default for GraphicEqSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            nodes: DEFAULT_GRAPHIC_EQ.to_string(),
        }
    }
}

/// Settings of a stage driven by one value.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleStage<T> {
    pub enabled: bool,
    pub value: T,
}

/// Settings of a stage backed by a file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileStage {
    pub enabled: bool,
    pub file: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvolverSettings {
    pub enabled: bool,
    pub file: String,
    pub advanced: String,
    pub optimization_mode: i32,
}

impl Default for ConvolverSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            file: String::new(),
            advanced: "-80;-100;0;0;0;0".to_string(),
            optimization_mode: 0,
        }
    }
}

/// Every stage's settings as read in one sync pass.
#[derive(Debug, Clone, PartialEq)]
struct DspSettings {
    output: OutputSettings,
    compander: CompanderSettings,
    bass: BassSettings,
    equalizer: EqualizerSettings,
    graphic_eq: GraphicEqSettings,
    reverb: SimpleStage<i32>,
    stereo_wide: SimpleStage<f32>,
    crossfeed: SimpleStage<i32>,
    tube: SimpleStage<f32>,
    ddc: FileStage,
    liveprog: FileStage,
    convolver: ConvolverSettings,
}

impl DspSettings {
    fn read(cache: &mut PreferenceCache) -> Self {
        cache.select(Namespace::Output.key());
        let d = OutputSettings::default();
        let output = OutputSettings {
            master_enable: cache.get("master_enable", d.master_enable),
            post_gain_db: cache.get("output_postgain", d.post_gain_db),
            limiter_threshold_db: cache.get("limiter_threshold", d.limiter_threshold_db),
            limiter_release_ms: cache.get("limiter_release", d.limiter_release_ms),
        };

        cache.select(Namespace::Compander.key());
        let d = CompanderSettings::default();
        let compander = CompanderSettings {
            enabled: cache.get("enable", d.enabled),
            time_constant: cache.get("timeconstant", d.time_constant),
            granularity: cache.get("granularity", d.granularity),
            tf_transforms: cache.get("tftransforms", d.tf_transforms),
            response: cache.get("response", d.response),
        };

        cache.select(Namespace::Bass.key());
        let d = BassSettings::default();
        let bass = BassSettings {
            enabled: cache.get("enable", d.enabled),
            max_gain_db: cache.get("maxgain", d.max_gain_db),
        };

        cache.select(Namespace::Equalizer.key());
        let d = EqualizerSettings::default();
        let equalizer = EqualizerSettings {
            enabled: cache.get("enable", d.enabled),
            filter_type: cache.get("filter_type", d.filter_type),
            interpolation: cache.get("interpolation", d.interpolation),
            bands: cache.get("bands", d.bands),
        };

        cache.select(Namespace::GraphicEq.key());
        let d = GraphicEqSettings::default();
        let graphic_eq = GraphicEqSettings {
            enabled: cache.get("enable", d.enabled),
            nodes: cache.get("nodes", d.nodes),
        };

        let reverb = read_simple(cache, Namespace::Reverb, "preset", 0);
        let stereo_wide = read_simple(cache, Namespace::StereoWide, "level", 60.0f32);
        let crossfeed = read_simple(cache, Namespace::Crossfeed, "mode", 0);
        let tube = read_simple(cache, Namespace::Tube, "drive", 2.0f32);
        let ddc = read_file_stage(cache, Namespace::Ddc);
        let liveprog = read_file_stage(cache, Namespace::Liveprog);

        cache.select(Namespace::Convolver.key());
        let d = ConvolverSettings::default();
        let convolver = ConvolverSettings {
            enabled: cache.get("enable", d.enabled),
            file: cache.get("file", d.file),
            advanced: cache.get("adv_imp", d.advanced),
            optimization_mode: cache.get("mode", d.optimization_mode),
        };

        Self {
            output,
            compander,
            bass,
            equalizer,
            graphic_eq,
            reverb,
            stereo_wide,
            crossfeed,
            tube,
            ddc,
            liveprog,
            convolver,
        }
    }
}

fn read_simple<T: crate::prefs::PrefType>(
    cache: &mut PreferenceCache,
    namespace: Namespace,
    key: &str,
    default: T,
) -> SimpleStage<T> {
    cache.select(namespace.key());
    SimpleStage {
        enabled: cache.get("enable", false),
        value: cache.get(key, default),
    }
}

fn read_file_stage(cache: &mut PreferenceCache, namespace: Namespace) -> FileStage {
    cache.select(namespace.key());
    FileStage {
        enabled: cache.get("enable", false),
        file: cache.get("file", String::new()),
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub applied: Vec<Namespace>,
    pub failed: Vec<(Namespace, DspError)>,
}

/// Owns the native engine handle and pushes preferences into it.
pub struct EngineFacade {
    engine: Mutex<Option<Box<dyn NativeEngine>>>,
    cache: Mutex<PreferenceCache>,
    callbacks: Arc<dyn EngineCallbacks>,
    enabled: AtomicBool,
    sample_rate: AtomicU32,
}

impl EngineFacade {
    pub fn new(
        engine: Box<dyn NativeEngine>,
        store: Arc<dyn PreferenceStore>,
        callbacks: Arc<dyn EngineCallbacks>,
    ) -> Self {
        Self {
            engine: Mutex::new(Some(engine)),
            cache: Mutex::new(PreferenceCache::new(store)),
            callbacks,
            enabled: AtomicBool::new(true),
            sample_rate: AtomicU32::new(0),
        }
    }

    /// Mirror preference reads into a channel for crash reports.
    pub fn diagnostics(&self) -> Receiver<PreferenceRead> {
        self.cache.lock().diagnostics()
    }

    pub fn is_released(&self) -> bool {
        self.engine.lock().is_none()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// When disabled, buffers pass through untouched.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Current sample rate, 0 before the first call to [`Self::set_sample_rate`].
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub fn set_sample_rate(&self, sample_rate: u32) -> DspResult<()> {
        info!(sample_rate, "Setting engine sample rate");
        let ok = self.with_engine(|e| e.set_sample_rate(sample_rate as f32))?;
        if !ok {
            return Err(DspError::StageRejected("sample rate"));
        }
        self.sample_rate.store(sample_rate, Ordering::Relaxed);
        Ok(())
    }

    /// Forget cached preferences so the next sync applies every stage.
    pub fn invalidate_preferences(&self) {
        self.cache.lock().clear();
    }

    /// Read every namespace and apply those that changed, plus `force`.
    ///
    /// A failing stage is logged and reported; the others are still applied.
    #[instrument(name = "dsp_sync", skip(self))]
    pub fn sync_with_preferences(&self, force: &[Namespace]) -> DspResult<SyncReport> {
        if self.is_released() {
            return Err(DspError::EngineReleased);
        }

        let mut cache = self.cache.lock();
        let settings = DspSettings::read(&mut cache);

        let mut targets: Vec<Namespace> = cache
            .changed_namespaces()
            .iter()
            .filter_map(|key| Namespace::from_key(key))
            .collect();
        for namespace in force {
            if !targets.contains(namespace) {
                targets.push(*namespace);
            }
        }

        let mut report = SyncReport::default();
        for namespace in targets {
            match self.apply(namespace, &settings) {
                Ok(()) => report.applied.push(namespace),
                Err(e) => {
                    warn!(namespace = namespace.key(), "Failed to apply settings: {}", e);
                    report.failed.push((namespace, e));
                }
            }
        }

        cache.mark_changes_as_committed();
        debug!(
            applied = report.applied.len(),
            failed = report.failed.len(),
            "Preferences synced"
        );
        Ok(report)
    }

    fn apply(&self, namespace: Namespace, settings: &DspSettings) -> DspResult<()> {
        match namespace {
            Namespace::Output => self.set_output_control(&settings.output),
            Namespace::Compander => self.set_compander(&settings.compander),
            Namespace::Bass => self.set_bass_boost(&settings.bass),
            Namespace::Equalizer => self.set_fir_equalizer(&settings.equalizer),
            Namespace::GraphicEq => self.set_graphic_eq(&settings.graphic_eq),
            Namespace::Reverb => self.set_reverb(&settings.reverb),
            Namespace::StereoWide => self.set_stereo_enhancement(&settings.stereo_wide),
            Namespace::Crossfeed => self.set_crossfeed(&settings.crossfeed),
            Namespace::Tube => self.set_vacuum_tube(&settings.tube),
            Namespace::Ddc => self.set_vdc(&settings.ddc),
            Namespace::Liveprog => self.set_liveprog(&settings.liveprog),
            Namespace::Convolver => self.set_convolver(&settings.convolver),
        }
    }

    pub fn set_output_control(&self, s: &OutputSettings) -> DspResult<()> {
        self.set_enabled(s.master_enable);
        let ok = self.with_engine(|e| {
            e.set_output_control(s.limiter_threshold_db, s.limiter_release_ms, s.post_gain_db)
        })?;
        accepted(ok, Namespace::Output)
    }

    pub fn set_compander(&self, s: &CompanderSettings) -> DspResult<()> {
        let response = parse_values(Namespace::Compander, &s.response, COMPANDER_RESPONSE_COUNT)?;
        let ok = self.with_engine(|e| {
            e.set_compander(s.enabled, s.time_constant, s.granularity, s.tf_transforms, &response)
        })?;
        accepted(ok, Namespace::Compander)
    }

    pub fn set_bass_boost(&self, s: &BassSettings) -> DspResult<()> {
        let ok = self.with_engine(|e| e.set_bass_boost(s.enabled, s.max_gain_db))?;
        accepted(ok, Namespace::Bass)
    }

    pub fn set_fir_equalizer(&self, s: &EqualizerSettings) -> DspResult<()> {
        let bands = parse_values(Namespace::Equalizer, &s.bands, EQ_BAND_COUNT)?;
        let ok = self.with_engine(|e| {
            e.set_fir_equalizer(s.enabled, s.filter_type, s.interpolation, &bands)
        })?;
        accepted(ok, Namespace::Equalizer)
    }

    pub fn set_graphic_eq(&self, s: &GraphicEqSettings) -> DspResult<()> {
        if !s.nodes.to_lowercase().contains(GRAPHIC_EQ_HEADER) {
            self.with_engine(|e| e.set_graphic_eq(false, DEFAULT_GRAPHIC_EQ))?;
            return Err(DspError::malformed(
                Namespace::GraphicEq.stage(),
                "missing 'GraphicEQ:' header",
            ));
        }
        let ok = self.with_engine(|e| e.set_graphic_eq(s.enabled, &s.nodes))?;
        accepted(ok, Namespace::GraphicEq)
    }

    pub fn set_reverb(&self, s: &SimpleStage<i32>) -> DspResult<()> {
        let ok = self.with_engine(|e| e.set_reverb(s.enabled, s.value))?;
        accepted(ok, Namespace::Reverb)
    }

    pub fn set_stereo_enhancement(&self, s: &SimpleStage<f32>) -> DspResult<()> {
        let ok = self.with_engine(|e| e.set_stereo_enhancement(s.enabled, s.value))?;
        accepted(ok, Namespace::StereoWide)
    }

    pub fn set_crossfeed(&self, s: &SimpleStage<i32>) -> DspResult<()> {
        let ok = self.with_engine(|e| e.set_crossfeed(s.enabled, s.value))?;
        accepted(ok, Namespace::Crossfeed)
    }

    pub fn set_vacuum_tube(&self, s: &SimpleStage<f32>) -> DspResult<()> {
        let ok = self.with_engine(|e| e.set_vacuum_tube(s.enabled, s.value))?;
        accepted(ok, Namespace::Tube)
    }

    /// Load a DDC file. A missing file disables the stage.
    pub fn set_vdc(&self, s: &FileStage) -> DspResult<()> {
        let Some(path) = self.enabled_file(s.enabled, &s.file, Namespace::Ddc) else {
            self.with_engine(|e| e.set_vdc(false, ""))?;
            return Ok(());
        };

        let contents = match read_file(path) {
            Ok(contents) => contents,
            Err(e) => {
                self.with_engine(|e| e.set_vdc(false, ""))?;
                return Err(e);
            }
        };

        if !self.with_engine(|e| e.set_vdc(true, &contents))? {
            self.callbacks.on_vdc_parse_error();
            return Err(DspError::StageRejected(Namespace::Ddc.stage()));
        }
        Ok(())
    }

    /// Load a liveprog script. A missing file disables the stage.
    pub fn set_liveprog(&self, s: &FileStage) -> DspResult<()> {
        let Some(path) = self.enabled_file(s.enabled, &s.file, Namespace::Liveprog) else {
            self.with_engine(|e| e.set_liveprog(false, "", ""))?;
            return Ok(());
        };

        let script = match read_file(path) {
            Ok(script) => script,
            Err(e) => {
                self.with_engine(|e| e.set_liveprog(false, "", ""))?;
                return Err(e);
            }
        };
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let ok = self.with_engine(|e| e.set_liveprog(true, &name, &script))?;
        accepted(ok, Namespace::Liveprog)
    }

    /// Load an impulse response. A missing file disables the stage; an
    /// undecodable or empty one disables it and fails.
    pub fn set_convolver(&self, s: &ConvolverSettings) -> DspResult<()> {
        let advanced = parse_values(Namespace::Convolver, &s.advanced, DEFAULT_CONVOLVER_ADVANCED.len())
            .map(|values| {
                let mut advanced = [0i32; 6];
                for (slot, value) in advanced.iter_mut().zip(values) {
                    *slot = value as i32;
                }
                advanced
            })
            .unwrap_or_else(|e| {
                warn!("{}, using defaults", e);
                self.callbacks
                    .on_convolver_error(ConvolverError::AdvancedParamsInvalid);
                DEFAULT_CONVOLVER_ADVANCED
            });

        let Some(path) = self.enabled_file(s.enabled, &s.file, Namespace::Convolver) else {
            self.with_engine(|e| e.set_convolver(false, None, &advanced))?;
            return Ok(());
        };

        let impulse = self.with_engine(|e| e.read_impulse_response(path, s.optimization_mode))?;
        let failure = match &impulse {
            None => Some((ConvolverError::Corrupted, "impulse response could not be decoded")),
            Some(ir) if ir.frames == 0 => Some((ConvolverError::NoFrames, "impulse response has no frames")),
            Some(_) => None,
        };
        if let Some((error, reason)) = failure {
            self.with_engine(|e| e.set_convolver(false, None, &advanced))?;
            self.callbacks.on_convolver_error(error);
            return Err(DspError::malformed(Namespace::Convolver.stage(), reason));
        }

        let ok = self.with_engine(|e| e.set_convolver(true, impulse.as_ref(), &advanced))?;
        accepted(ok, Namespace::Convolver)
    }

    /// Transform float samples. Copies input to output when disabled or released.
    pub fn process_f32(&self, input: &[f32], output: &mut [f32]) {
        let n = input.len().min(output.len());
        if self.is_enabled() {
            if let Some(engine) = self.engine.lock().as_mut() {
                engine.process_f32(&input[..n], &mut output[..n]);
                return;
            }
        }
        output[..n].copy_from_slice(&input[..n]);
    }

    /// Transform 16-bit samples. Copies input to output when disabled or released.
    pub fn process_i16(&self, input: &[i16], output: &mut [i16]) {
        let n = input.len().min(output.len());
        if self.is_enabled() {
            if let Some(engine) = self.engine.lock().as_mut() {
                engine.process_i16(&input[..n], &mut output[..n]);
                return;
            }
        }
        output[..n].copy_from_slice(&input[..n]);
    }

    /// Free the native handle. Later calls do nothing.
    pub fn release(&self) {
        if let Some(mut engine) = self.engine.lock().take() {
            engine.free();
            info!("Engine released");
        }
    }

    fn with_engine<R>(&self, f: impl FnOnce(&mut dyn NativeEngine) -> R) -> DspResult<R> {
        let mut engine = self.engine.lock();
        let engine = engine.as_mut().ok_or(DspError::EngineReleased)?;
        Ok(f(engine.as_mut()))
    }

    fn enabled_file<'a>(&self, enabled: bool, file: &'a str, namespace: Namespace) -> Option<&'a Path> {
        if !enabled {
            return None;
        }
        let path = Path::new(file);
        if file.is_empty() || !path.is_file() {
            debug!(stage = namespace.stage(), file, "File missing, disabling stage");
            return None;
        }
        Some(path)
    }
}

impl Drop for EngineFacade {
    fn drop(&mut self) {
        self.release();
    }
}

fn accepted(ok: bool, namespace: Namespace) -> DspResult<()> {
    if ok {
        Ok(())
    } else {
        Err(DspError::StageRejected(namespace.stage()))
    }
}

fn read_file(path: &Path) -> DspResult<String> {
    fs::read_to_string(path).map_err(|source| DspError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Parse `;`-separated numbers, requiring exactly `expected` of them.
fn parse_values(namespace: Namespace, raw: &str, expected: usize) -> DspResult<Vec<f64>> {
    let values = raw
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>().map_err(|_| {
                DspError::malformed(namespace.stage(), format!("'{s}' is not a number"))
            })
        })
        .collect::<DspResult<Vec<f64>>>()?;

    if values.len() != expected {
        return Err(DspError::malformed(
            namespace.stage(),
            format!("expected {expected} values, found {}", values.len()),
        ));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::prefs::MemoryPreferences;
    use crate::testing::{MockEngine, MockEngineState, RecordingCallbacks};

    struct Fixture {
        prefs: Arc<MemoryPreferences>,
        state: Arc<Mutex<MockEngineState>>,
        callbacks: Arc<RecordingCallbacks>,
        facade: EngineFacade,
    }

    fn fixture() -> Fixture {
        let prefs = Arc::new(MemoryPreferences::new());
        let (engine, state) = MockEngine::new();
        let callbacks = Arc::new(RecordingCallbacks::default());
        let facade = EngineFacade::new(Box::new(engine), prefs.clone(), callbacks.clone());
        Fixture {
            prefs,
            state,
            callbacks,
            facade,
        }
    }

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("loopfx-{}-{}", std::process::id(), name));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_first_sync_applies_every_namespace() {
        let f = fixture();

        let report = f.facade.sync_with_preferences(&[]).unwrap();

        assert!(report.failed.is_empty(), "{:?}", report.failed);
        assert_eq!(report.applied.len(), Namespace::ALL.len());
        let state = f.state.lock();
        assert_eq!(state.equalizer_bands.as_ref().map(Vec::len), Some(EQ_BAND_COUNT));
        assert_eq!(state.output, Some((-0.1, 60.0, 0.0)));
    }

    #[test]
    fn test_second_sync_touches_only_changed() {
        let f = fixture();
        f.facade.sync_with_preferences(&[]).unwrap();

        f.prefs.set("dsp_bass", "maxgain", 8.0f32);
        let report = f.facade.sync_with_preferences(&[]).unwrap();

        assert_eq!(report.applied, vec![Namespace::Bass]);
        assert_eq!(f.state.lock().bass_gain, Some(8.0));
    }

    #[test]
    fn test_forced_namespace_is_applied_once() {
        let f = fixture();
        f.facade.sync_with_preferences(&[]).unwrap();
        f.state.lock().calls.clear();

        f.prefs.set("dsp_convolver", "mode", 1);
        let report = f
            .facade
            .sync_with_preferences(&[Namespace::Convolver, Namespace::Liveprog])
            .unwrap();

        assert_eq!(report.applied, vec![Namespace::Convolver, Namespace::Liveprog]);
        assert_eq!(f.state.lock().calls, vec!["convolver", "liveprog"]);
    }

    #[test]
    fn test_malformed_equalizer_keeps_previous_state() {
        let f = fixture();
        f.prefs.set("dsp_equalizer", "enable", true);
        f.facade.sync_with_preferences(&[]).unwrap();
        let before = f.state.lock().equalizer_bands.clone();

        f.prefs.set("dsp_equalizer", "bands", "1;2;3".to_string());
        let report = f.facade.sync_with_preferences(&[]).unwrap();

        assert!(report.applied.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, Namespace::Equalizer);
        assert!(matches!(
            report.failed[0].1,
            DspError::MalformedConfiguration { stage: "equalizer", .. }
        ));
        assert_eq!(f.state.lock().equalizer_bands, before);
    }

    #[test]
    fn test_non_numeric_band_is_rejected() {
        let f = fixture();
        let mut bands: Vec<String> = DEFAULT_EQ_BANDS.split(';').map(String::from).collect();
        bands[3] = "loud".into();

        let result = f.facade.set_fir_equalizer(&EqualizerSettings {
            bands: bands.join(";"),
            ..EqualizerSettings::default()
        });

        assert!(matches!(result, Err(DspError::MalformedConfiguration { .. })));
        assert!(f.state.lock().calls.is_empty());
    }

    #[test]
    fn test_compander_response_count() {
        let f = fixture();

        assert!(f.facade.set_compander(&CompanderSettings::default()).is_ok());
        let result = f.facade.set_compander(&CompanderSettings {
            response: "1;2".into(),
            ..CompanderSettings::default()
        });

        assert!(matches!(result, Err(DspError::MalformedConfiguration { .. })));
        assert_eq!(f.state.lock().compander_response.as_ref().map(Vec::len), Some(14));
    }

    #[test]
    fn test_graphic_eq_requires_header() {
        let f = fixture();

        assert!(f.facade.set_graphic_eq(&GraphicEqSettings {
            enabled: true,
            nodes: "graphiceq: 100 1.0; 200 -2.0".into(),
        })
        .is_ok());
        let result = f.facade.set_graphic_eq(&GraphicEqSettings {
            enabled: true,
            nodes: "100 1.0; 200 -2.0".into(),
        });

        assert!(matches!(result, Err(DspError::MalformedConfiguration { .. })));
        assert_eq!(f.state.lock().stages.get("graphic_eq"), Some(&false));
    }

    #[test]
    fn test_missing_ddc_file_disables_stage() {
        let f = fixture();

        let result = f.facade.set_vdc(&FileStage {
            enabled: true,
            file: "/nonexistent/loopfx/test.vdc".into(),
        });

        assert!(result.is_ok());
        assert_eq!(f.state.lock().stages.get("ddc"), Some(&false));
    }

    #[test]
    fn test_ddc_file_is_loaded() {
        let f = fixture();
        let path = temp_file("load.vdc", "SR_44100:1,2,3");

        f.facade
            .set_vdc(&FileStage {
                enabled: true,
                file: path.display().to_string(),
            })
            .unwrap();

        assert_eq!(f.state.lock().vdc.as_deref(), Some("SR_44100:1,2,3"));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_rejected_ddc_reports_parse_error() {
        let f = fixture();
        let path = temp_file("bad.vdc", "garbage");
        f.state.lock().reject.insert("ddc");

        let result = f.facade.set_vdc(&FileStage {
            enabled: true,
            file: path.display().to_string(),
        });

        assert!(matches!(result, Err(DspError::StageRejected("ddc"))));
        assert_eq!(f.callbacks.vdc_errors(), 1);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_liveprog_uses_file_name_as_name() {
        let f = fixture();
        let path = temp_file("gain.eel", "desc: gain");

        f.facade
            .set_liveprog(&FileStage {
                enabled: true,
                file: path.display().to_string(),
            })
            .unwrap();

        let expected = format!("loopfx-{}-gain.eel", std::process::id());
        assert_eq!(
            f.state.lock().liveprog,
            Some((expected, "desc: gain".to_string()))
        );
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_bad_convolver_params_fall_back_to_defaults() {
        let f = fixture();

        f.facade
            .set_convolver(&ConvolverSettings {
                advanced: "1;2;3".into(),
                ..ConvolverSettings::default()
            })
            .unwrap();

        assert_eq!(
            f.callbacks.convolver_errors(),
            vec![ConvolverError::AdvancedParamsInvalid]
        );
        assert_eq!(f.state.lock().convolver_advanced, Some(DEFAULT_CONVOLVER_ADVANCED));
    }

    #[test]
    fn test_empty_impulse_response_disables_convolver() {
        let f = fixture();
        let path = temp_file("empty.wav", "RIFF");
        f.state.lock().impulse_frames = Some(0);

        let result = f.facade.set_convolver(&ConvolverSettings {
            enabled: true,
            file: path.display().to_string(),
            ..ConvolverSettings::default()
        });

        assert!(result.is_err());
        assert_eq!(f.state.lock().stages.get("convolver"), Some(&false));
        assert_eq!(f.callbacks.convolver_errors(), vec![ConvolverError::NoFrames]);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_corrupted_impulse_response_disables_convolver() {
        let f = fixture();
        let path = temp_file("corrupt.wav", "????");
        f.state.lock().impulse_frames = None;

        let result = f.facade.set_convolver(&ConvolverSettings {
            enabled: true,
            file: path.display().to_string(),
            ..ConvolverSettings::default()
        });

        assert!(result.is_err());
        assert_eq!(f.callbacks.convolver_errors(), vec![ConvolverError::Corrupted]);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_impulse_response_is_loaded() {
        let f = fixture();
        let path = temp_file("room.wav", "RIFF");
        f.state.lock().impulse_frames = Some(480);

        f.facade
            .set_convolver(&ConvolverSettings {
                enabled: true,
                file: path.display().to_string(),
                ..ConvolverSettings::default()
            })
            .unwrap();

        let state = f.state.lock();
        assert_eq!(state.stages.get("convolver"), Some(&true));
        assert_eq!(state.convolver_frames, Some(480));
        drop(state);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_rejected_stage_does_not_stop_sync() {
        let f = fixture();
        f.state.lock().reject.insert("bass");

        let report = f.facade.sync_with_preferences(&[]).unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, Namespace::Bass);
        assert_eq!(report.applied.len(), Namespace::ALL.len() - 1);

        // Committed despite the failure.
        let report = f.facade.sync_with_preferences(&[]).unwrap();
        assert!(report.applied.is_empty() && report.failed.is_empty());
    }

    #[test]
    fn test_disabled_engine_passes_audio_through() {
        let f = fixture();
        let input = [0.5f32, -0.5, 0.25, 1.0];
        let mut output = [0.0f32; 4];

        f.facade.process_f32(&input, &mut output);
        assert_eq!(output, [0.25, -0.25, 0.125, 0.5]);

        f.prefs.set("dsp_output_control", "master_enable", false);
        f.facade.sync_with_preferences(&[]).unwrap();
        f.facade.process_f32(&input, &mut output);
        assert_eq!(output, input);
    }

    #[test]
    fn test_release_is_final() {
        let f = fixture();
        f.facade.release();
        f.facade.release();

        assert_eq!(f.state.lock().freed, 1);
        assert!(matches!(
            f.facade.sync_with_preferences(&[]),
            Err(DspError::EngineReleased)
        ));
        assert!(matches!(
            f.facade.set_bass_boost(&BassSettings::default()),
            Err(DspError::EngineReleased)
        ));

        let input = [100i16, -100];
        let mut output = [0i16; 2];
        f.facade.process_i16(&input, &mut output);
        assert_eq!(output, input);
    }

    #[test]
    fn test_sample_rate() {
        let f = fixture();
        assert_eq!(f.facade.sample_rate(), 0);

        f.facade.set_sample_rate(44_100).unwrap();

        assert_eq!(f.facade.sample_rate(), 44_100);
        assert_eq!(f.state.lock().sample_rate, Some(44_100.0));
    }

    #[test]
    fn test_namespace_keys_round_trip() {
        for namespace in Namespace::ALL {
            assert_eq!(Namespace::from_key(namespace.key()), Some(namespace));
        }
        assert_eq!(Namespace::from_key("dsp_unknown"), None);
    }
}
