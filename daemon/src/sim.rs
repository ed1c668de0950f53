//! Simulated platform: a sine-wave capture source, a null output device and
//! in-memory session dumps.

use std::collections::HashMap;
use std::f32::consts::TAU;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use loopfx_audio::{
    AudioError, AudioHost, AudioResult, CaptureAuthorization, CaptureConfig, CaptureDevice,
    DeviceRelease, RenderDevice, StreamFormat, CHANNELS,
};
use loopfx_dsp::{ImpulseResponse, NativeEngine};
use loopfx_ipc::DumpMethod;
use loopfx_session::{
    CapturePermissionLog, EffectHost, EffectInstance, EffectType, HostNotification,
    MuteEffectKind, PackageResolver, SessionDump, SessionDumpEntry, SessionDumpProvider,
    SessionResult, StatusHandler,
};

use crate::config::SimulatedSession;

const TONE_HZ: f32 = 440.0;
const TONE_AMPLITUDE: f32 = 0.25;

/// Shared state of the simulated platform.
pub struct SimPlatform {
    sessions: Mutex<Vec<SimulatedSession>>,
    notify_tx: Sender<HostNotification>,
    sample_rate: Mutex<Option<u32>>,
    authorization: Mutex<Option<CaptureAuthorization>>,
    rendered_samples: AtomicU64,
    peak: Mutex<f32>,
}

impl SimPlatform {
    pub fn new(
        sessions: Vec<SimulatedSession>,
        sample_rate: Option<u32>,
    ) -> (Arc<Self>, Receiver<HostNotification>) {
        let (notify_tx, notify_rx) = crossbeam_channel::unbounded();
        let platform = Arc::new(Self {
            sessions: Mutex::new(sessions),
            notify_tx,
            sample_rate: Mutex::new(sample_rate),
            authorization: Mutex::new(None),
            rendered_samples: AtomicU64::new(0),
            peak: Mutex::new(0.0),
        });
        (platform, notify_rx)
    }

    /// Add or replace a session and tell the listener.
    pub fn add_session(&self, session: SimulatedSession) {
        {
            let mut sessions = self.sessions.lock();
            sessions.retain(|s| s.session_id != session.session_id);
            sessions.push(session);
        }
        self.notify(HostNotification::PlaybackConfigChanged);
    }

    /// Returns whether the session existed.
    pub fn remove_session(&self, session_id: i32) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock();
            let before = sessions.len();
            sessions.retain(|s| s.session_id != session_id);
            sessions.len() != before
        };
        if removed {
            self.notify(HostNotification::PlaybackConfigChanged);
        }
        removed
    }

    pub fn set_sample_rate(&self, sample_rate: Option<u32>) {
        *self.sample_rate.lock() = sample_rate;
    }

    /// Withdraw the current capture authorization, as a user would.
    pub fn revoke_authorization(&self) -> bool {
        match self.authorization.lock().take() {
            Some(authorization) => {
                authorization.revoke();
                true
            }
            None => false,
        }
    }

    pub fn rendered_samples(&self) -> u64 {
        self.rendered_samples.load(Ordering::Relaxed)
    }

    /// Peak absolute level written since the last call.
    pub fn take_peak(&self) -> f32 {
        std::mem::take(&mut *self.peak.lock())
    }

    fn notify(&self, notification: HostNotification) {
        if let Err(e) = self.notify_tx.send(notification) {
            warn!("Failed to deliver host notification: {}", e);
        }
    }

    fn dump(&self, with_policy: bool) -> SessionDump {
        let sessions = self.sessions.lock();
        let mut dump = SessionDump::new();
        for session in sessions.iter() {
            dump = dump.with_session(
                session.session_id,
                SessionDumpEntry::new(session.uid, session.package_name.clone(), session.usage.clone()),
            );
        }
        if with_policy {
            dump = dump.with_permission_log(permission_log(&sessions));
        }
        dump
    }
}

fn permission_log(sessions: &[SimulatedSession]) -> CapturePermissionLog {
    sessions
        .iter()
        .map(|s| (s.package_name.clone(), s.capture_allowed))
        .collect()
}

/// Audio host producing a stereo tone.
pub struct SimAudioHost {
    platform: Arc<SimPlatform>,
}

impl SimAudioHost {
    pub fn new(platform: Arc<SimPlatform>) -> Self {
        Self { platform }
    }
}

impl AudioHost for SimAudioHost {
    fn output_sample_rate(&self) -> Option<u32> {
        *self.platform.sample_rate.lock()
    }

    fn frames_per_buffer(&self) -> Option<u32> {
        Some(256)
    }

    fn request_authorization(&self) -> AudioResult<CaptureAuthorization> {
        let authorization = CaptureAuthorization::new();
        *self.platform.authorization.lock() = Some(authorization.clone());
        info!("Capture authorization granted");
        Ok(authorization)
    }

    fn build_capture(&self, config: &CaptureConfig) -> AudioResult<Box<dyn CaptureDevice>> {
        if !config.authorization.is_valid() {
            return Err(AudioError::AuthorizationRevoked);
        }
        info!(excluded = ?config.excluded_uids, "Building simulated capture device");
        Ok(Box::new(ToneCapture {
            format: config.format,
            authorization: config.authorization.clone(),
            phase: 0.0,
            running: false,
            release: DeviceRelease::new(|| debug!("Simulated capture released")),
        }))
    }

    fn build_render(
        &self,
        format: &StreamFormat,
        buffer_bytes: usize,
    ) -> AudioResult<Box<dyn RenderDevice>> {
        debug!(sample_rate = format.sample_rate, buffer_bytes, "Building simulated render device");
        Ok(Box::new(NullRender {
            platform: Arc::clone(&self.platform),
            running: false,
            release: DeviceRelease::new(|| debug!("Simulated render released")),
        }))
    }
}

struct ToneCapture {
    format: StreamFormat,
    authorization: CaptureAuthorization,
    phase: f32,
    running: bool,
    release: DeviceRelease,
}

impl ToneCapture {
    /// Produce `len` samples paced at the stream's real-time rate.
    fn next_samples(&mut self, len: usize, mut put: impl FnMut(usize, f32)) -> AudioResult<usize> {
        if self.release.is_released() {
            return Err(AudioError::Read("capture released".into()));
        }
        if !self.authorization.is_valid() {
            return Err(AudioError::AuthorizationRevoked);
        }

        let rate = self.format.sample_rate as f32;
        let frames = len / CHANNELS;
        for frame in 0..frames {
            let value = (self.phase * TAU).sin() * TONE_AMPLITUDE;
            self.phase = (self.phase + TONE_HZ / rate).fract();
            for channel in 0..CHANNELS {
                put(frame * CHANNELS + channel, value);
            }
        }

        let seconds = frames as f64 / f64::from(self.format.sample_rate);
        thread::sleep(Duration::from_secs_f64(seconds));
        Ok(frames * CHANNELS)
    }
}

impl CaptureDevice for ToneCapture {
    fn start(&mut self) -> AudioResult<()> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn read_f32(&mut self, buffer: &mut [f32]) -> AudioResult<usize> {
        self.next_samples(buffer.len(), |i, v| buffer[i] = v)
    }

    fn read_i16(&mut self, buffer: &mut [i16]) -> AudioResult<usize> {
        self.next_samples(buffer.len(), |i, v| buffer[i] = (v * f32::from(i16::MAX)) as i16)
    }

    fn release_handle(&self) -> DeviceRelease {
        self.release.clone()
    }
}

struct NullRender {
    platform: Arc<SimPlatform>,
    running: bool,
    release: DeviceRelease,
}

impl NullRender {
    fn record(&self, samples: usize, peak: f32) {
        self.platform
            .rendered_samples
            .fetch_add(samples as u64, Ordering::Relaxed);
        let mut current = self.platform.peak.lock();
        if peak > *current {
            *current = peak;
        }
    }
}

impl RenderDevice for NullRender {
    fn start(&mut self) -> AudioResult<()> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn write_f32(&mut self, buffer: &[f32]) -> AudioResult<usize> {
        let peak = buffer.iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
        self.record(buffer.len(), peak);
        Ok(buffer.len())
    }

    fn write_i16(&mut self, buffer: &[i16]) -> AudioResult<usize> {
        let peak = buffer
            .iter()
            .fold(0.0f32, |peak, s| peak.max(f32::from(*s).abs() / f32::from(i16::MAX)));
        self.record(buffer.len(), peak);
        Ok(buffer.len())
    }

    fn release_handle(&self) -> DeviceRelease {
        self.release.clone()
    }
}

/// Effect host that accepts every effect type.
#[derive(Default)]
pub struct SimEffectHost;

impl EffectHost for SimEffectHost {
    fn is_available(&self, _effect: EffectType) -> bool {
        true
    }

    fn create(
        &self,
        effect: EffectType,
        session_id: i32,
        _priority: i32,
    ) -> SessionResult<Arc<dyn EffectInstance>> {
        debug!(effect = effect.name(), session_id, "Simulated effect created");
        Ok(Arc::new(SimEffect::default()))
    }

    fn close_control_session(&self, package_name: &str, session_id: i32) {
        debug!(package = package_name, session_id, "Control session close requested");
    }
}

#[derive(Default)]
struct SimEffect {
    enabled: AtomicBool,
    handler: Mutex<Option<StatusHandler>>,
}

impl EffectInstance for SimEffect {
    fn apply(&self, kind: &MuteEffectKind) -> SessionResult<()> {
        debug!(?kind, "Simulated mute applied");
        Ok(())
    }

    fn set_enabled(&self, enabled: bool) -> SessionResult<()> {
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn set_status_handler(&self, handler: StatusHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn release(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.handler.lock().take();
    }
}

/// Dump provider reading the simulated session list.
pub struct SimDumpProvider {
    platform: Arc<SimPlatform>,
    method: DumpMethod,
}

impl SimDumpProvider {
    pub fn new(platform: Arc<SimPlatform>, method: DumpMethod) -> Self {
        Self { platform, method }
    }
}

impl SessionDumpProvider for SimDumpProvider {
    fn method(&self) -> DumpMethod {
        self.method
    }

    fn dump_sessions(&self) -> SessionResult<SessionDump> {
        // Only the policy service reports capture permissions inline.
        Ok(self
            .platform
            .dump(self.method == DumpMethod::AudioPolicyService))
    }

    fn dump_capture_allowlist_log(&self) -> SessionResult<Option<CapturePermissionLog>> {
        if self.method != DumpMethod::AudioPolicyService {
            return Ok(None);
        }
        Ok(Some(permission_log(&self.platform.sessions.lock())))
    }
}

/// Resolves packages of the simulated sessions.
pub struct SimResolver {
    platform: Arc<SimPlatform>,
}

impl SimResolver {
    pub fn new(platform: Arc<SimPlatform>) -> Self {
        Self { platform }
    }
}

impl PackageResolver for SimResolver {
    fn uid_for_package(&self, package_name: &str) -> Option<i32> {
        self.platform
            .sessions
            .lock()
            .iter()
            .find(|s| s.package_name == package_name)
            .map(|s| s.uid)
    }
}

/// Engine applying only the output post gain; other stages are accepted
/// and recorded.
pub struct GainEngine {
    gain: f32,
    stages: HashMap<&'static str, bool>,
}

impl GainEngine {
    pub fn new() -> Self {
        Self {
            gain: 1.0,
            stages: HashMap::new(),
        }
    }

    fn stage(&mut self, stage: &'static str, enabled: bool) -> bool {
        debug!(stage, enabled, "Stage configured");
        self.stages.insert(stage, enabled);
        true
    }
}

impl Default for GainEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeEngine for GainEngine {
    fn set_sample_rate(&mut self, sample_rate: f32) -> bool {
        debug!(sample_rate, "Engine sample rate");
        sample_rate > 0.0
    }

    fn set_output_control(&mut self, threshold_db: f32, release_ms: f32, post_gain_db: f32) -> bool {
        debug!(threshold_db, release_ms, post_gain_db, "Output control");
        self.gain = 10f32.powf(post_gain_db / 20.0);
        true
    }

    fn set_compander(
        &mut self,
        enabled: bool,
        _time_constant: f32,
        _granularity: i32,
        _tf_transforms: i32,
        _response: &[f64],
    ) -> bool {
        self.stage("compander", enabled)
    }

    fn set_bass_boost(&mut self, enabled: bool, _max_gain_db: f32) -> bool {
        self.stage("bass", enabled)
    }

    fn set_fir_equalizer(
        &mut self,
        enabled: bool,
        _filter_type: i32,
        _interpolation: i32,
        _bands: &[f64],
    ) -> bool {
        self.stage("equalizer", enabled)
    }

    fn set_graphic_eq(&mut self, enabled: bool, _nodes: &str) -> bool {
        self.stage("graphic_eq", enabled)
    }

    fn set_reverb(&mut self, enabled: bool, _preset: i32) -> bool {
        self.stage("reverb", enabled)
    }

    fn set_stereo_enhancement(&mut self, enabled: bool, _level: f32) -> bool {
        self.stage("stereo_wide", enabled)
    }

    fn set_crossfeed(&mut self, enabled: bool, _mode: i32) -> bool {
        self.stage("crossfeed", enabled)
    }

    fn set_vacuum_tube(&mut self, enabled: bool, _drive: f32) -> bool {
        self.stage("tube", enabled)
    }

    fn set_vdc(&mut self, enabled: bool, _contents: &str) -> bool {
        self.stage("ddc", enabled)
    }

    fn set_liveprog(&mut self, enabled: bool, name: &str, _script: &str) -> bool {
        debug!(name, "Liveprog script");
        self.stage("liveprog", enabled)
    }

    fn set_convolver(
        &mut self,
        enabled: bool,
        impulse: Option<&ImpulseResponse>,
        _advanced: &[i32; 6],
    ) -> bool {
        debug!(frames = impulse.map_or(0, |ir| ir.frames), "Convolver impulse");
        self.stage("convolver", enabled)
    }

    /// Reads raw little-endian stereo f32 samples.
    fn read_impulse_response(&mut self, path: &Path, _optimization_mode: i32) -> Option<ImpulseResponse> {
        let bytes = fs::read(path).ok()?;
        let samples: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Some(ImpulseResponse {
            channels: CHANNELS,
            frames: samples.len() / CHANNELS,
            samples,
        })
    }

    fn process_i16(&mut self, input: &[i16], output: &mut [i16]) {
        for (out, sample) in output.iter_mut().zip(input) {
            *out = (f32::from(*sample) * self.gain)
                .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
        }
    }

    fn process_f32(&mut self, input: &[f32], output: &mut [f32]) {
        for (out, sample) in output.iter_mut().zip(input) {
            *out = sample * self.gain;
        }
    }

    fn free(&mut self) {
        debug!(stages = ?self.stages, "Engine freed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: i32, uid: i32, package: &str, allowed: bool) -> SimulatedSession {
        SimulatedSession {
            session_id: id,
            uid,
            package_name: package.into(),
            usage: "USAGE_MEDIA".into(),
            capture_allowed: allowed,
        }
    }

    #[test]
    fn test_dump_carries_policy_only_for_policy_service() {
        let (platform, _rx) = SimPlatform::new(vec![session(1, 10100, "com.music", false)], None);

        let policy = SimDumpProvider::new(Arc::clone(&platform), DumpMethod::AudioPolicyService);
        let dump = policy.dump_sessions().unwrap();
        assert_eq!(dump.sessions.len(), 1);
        assert_eq!(
            dump.capture_permission_log.unwrap().get("com.music"),
            Some(&false)
        );

        let service = SimDumpProvider::new(platform, DumpMethod::AudioService);
        assert!(service.dump_sessions().unwrap().capture_permission_log.is_none());
        assert!(service.dump_capture_allowlist_log().unwrap().is_none());
    }

    #[test]
    fn test_session_changes_notify_listener() {
        let (platform, rx) = SimPlatform::new(Vec::new(), None);

        platform.add_session(session(3, 10300, "com.video", true));
        assert_eq!(rx.try_recv(), Ok(HostNotification::PlaybackConfigChanged));

        assert!(platform.remove_session(3));
        assert!(rx.try_recv().is_ok());
        assert!(!platform.remove_session(3));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_released_capture_stops_producing() {
        let (platform, _rx) = SimPlatform::new(Vec::new(), Some(48_000));
        let host = SimAudioHost::new(platform);
        let config = CaptureConfig {
            format: StreamFormat::new(loopfx_ipc::AudioEncoding::PcmFloat, Some(48_000), 64),
            excluded_uids: Vec::new(),
            authorization: CaptureAuthorization::new(),
        };
        let mut capture = host.build_capture(&config).unwrap();
        let mut buffer = [0.0f32; 64];
        assert_eq!(capture.read_f32(&mut buffer).unwrap(), 64);

        assert!(capture.release_handle().release());
        assert!(matches!(capture.read_f32(&mut buffer), Err(AudioError::Read(_))));
        assert!(!capture.release_handle().release());
    }

    #[test]
    fn test_resolver_uses_session_list() {
        let (platform, _rx) = SimPlatform::new(vec![session(1, 10100, "com.music", true)], None);
        let resolver = SimResolver::new(platform);
        assert_eq!(resolver.uid_for_package("com.music"), Some(10100));
        assert_eq!(resolver.uid_for_package("com.other"), None);
    }

    #[test]
    fn test_gain_engine_applies_post_gain() {
        let mut engine = GainEngine::new();
        let mut output = [0.0f32; 2];
        engine.process_f32(&[0.5, -0.5], &mut output);
        assert_eq!(output, [0.5, -0.5]);

        assert!(engine.set_output_control(-0.1, 60.0, -20.0));
        engine.process_f32(&[0.5, -0.5], &mut output);
        assert!((output[0] - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_revoking_without_authorization() {
        let (platform, _rx) = SimPlatform::new(Vec::new(), None);
        assert!(!platform.revoke_authorization());

        let host = SimAudioHost::new(Arc::clone(&platform));
        let authorization = host.request_authorization().unwrap();
        assert!(platform.revoke_authorization());
        assert!(!authorization.is_valid());
    }
}
