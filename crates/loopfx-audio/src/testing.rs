//! In-memory audio host for tests.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::device::{
    AudioHost, CaptureAuthorization, CaptureConfig, CaptureDevice, DeviceRelease,
    ExclusionProvider, RenderDevice, StreamFormat,
};
use crate::error::AudioError;
use crate::AudioResult;

/// Value every captured float sample has.
pub const CAPTURED_F32: f32 = 1.0;

/// Value every captured 16-bit sample has.
pub const CAPTURED_I16: i16 = 1000;

const READ_DELAY: Duration = Duration::from_millis(1);

/// What a [`MockAudioHost`] did and how it should misbehave.
#[derive(Debug, Default)]
pub struct MockHostState {
    pub sample_rate: Option<u32>,
    pub frames_per_buffer: Option<u32>,
    pub deny_authorization: bool,
    pub fail_capture_builds: bool,
    pub fail_render_builds: bool,
    /// Reads that fail before reads succeed again.
    pub failing_reads: usize,
    /// Extra time every read blocks for.
    pub read_delay: Option<Duration>,
    /// Exclusions passed to each capture build.
    pub capture_builds: Vec<Vec<i32>>,
    pub render_builds: Vec<usize>,
    pub captures_released: usize,
    pub renders_released: usize,
    pub capture_running: bool,
    pub render_running: bool,
    pub written_samples: usize,
    pub last_f32: Option<f32>,
    pub last_i16: Option<i16>,
    pub authorizations: Vec<CaptureAuthorization>,
}

/// Audio host whose capture devices produce constant samples.
#[derive(Clone)]
pub struct MockAudioHost {
    state: Arc<Mutex<MockHostState>>,
}

impl MockAudioHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockHostState {
                sample_rate: Some(48_000),
                frames_per_buffer: Some(256),
                ..MockHostState::default()
            })),
        }
    }

    pub fn state(&self) -> &Arc<Mutex<MockHostState>> {
        &self.state
    }

    /// Most recently granted authorization.
    pub fn authorization(&self) -> Option<CaptureAuthorization> {
        self.state.lock().authorizations.last().cloned()
    }
}

impl Default for MockAudioHost {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHost for MockAudioHost {
    fn output_sample_rate(&self) -> Option<u32> {
        self.state.lock().sample_rate
    }

    fn frames_per_buffer(&self) -> Option<u32> {
        self.state.lock().frames_per_buffer
    }

    fn request_authorization(&self) -> AudioResult<CaptureAuthorization> {
        let mut state = self.state.lock();
        if state.deny_authorization {
            return Err(AudioError::AuthorizationDenied("denied by mock".into()));
        }
        let authorization = CaptureAuthorization::new();
        state.authorizations.push(authorization.clone());
        Ok(authorization)
    }

    fn build_capture(&self, config: &CaptureConfig) -> AudioResult<Box<dyn CaptureDevice>> {
        let mut state = self.state.lock();
        if state.fail_capture_builds {
            return Err(AudioError::DeviceConstruction {
                device: "capture",
                message: "mock failure".into(),
            });
        }
        state.capture_builds.push(config.excluded_uids.clone());
        let released = Arc::clone(&self.state);
        Ok(Box::new(MockCapture {
            state: Arc::clone(&self.state),
            authorization: config.authorization.clone(),
            running: false,
            release: DeviceRelease::new(move || released.lock().captures_released += 1),
        }))
    }

    fn build_render(
        &self,
        _format: &StreamFormat,
        buffer_bytes: usize,
    ) -> AudioResult<Box<dyn RenderDevice>> {
        let mut state = self.state.lock();
        if state.fail_render_builds {
            return Err(AudioError::DeviceConstruction {
                device: "render",
                message: "mock failure".into(),
            });
        }
        state.render_builds.push(buffer_bytes);
        let released = Arc::clone(&self.state);
        Ok(Box::new(MockRender {
            state: Arc::clone(&self.state),
            running: false,
            release: DeviceRelease::new(move || released.lock().renders_released += 1),
        }))
    }
}

struct MockCapture {
    state: Arc<Mutex<MockHostState>>,
    authorization: CaptureAuthorization,
    running: bool,
    release: DeviceRelease,
}

impl MockCapture {
    fn read<T: Copy>(&mut self, buffer: &mut [T], value: T) -> AudioResult<usize> {
        thread::sleep(READ_DELAY);
        let delay = self.state.lock().read_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        if self.release.is_released() {
            return Err(AudioError::Read("device released".into()));
        }
        if !self.authorization.is_valid() {
            return Err(AudioError::AuthorizationRevoked);
        }
        let mut state = self.state.lock();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(AudioError::Read("mock failure".into()));
        }
        buffer.fill(value);
        Ok(buffer.len())
    }
}

impl CaptureDevice for MockCapture {
    fn start(&mut self) -> AudioResult<()> {
        self.running = true;
        self.state.lock().capture_running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
        self.state.lock().capture_running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn read_f32(&mut self, buffer: &mut [f32]) -> AudioResult<usize> {
        self.read(buffer, CAPTURED_F32)
    }

    fn read_i16(&mut self, buffer: &mut [i16]) -> AudioResult<usize> {
        self.read(buffer, CAPTURED_I16)
    }

    fn release_handle(&self) -> DeviceRelease {
        self.release.clone()
    }
}

struct MockRender {
    state: Arc<Mutex<MockHostState>>,
    running: bool,
    release: DeviceRelease,
}

impl RenderDevice for MockRender {
    fn start(&mut self) -> AudioResult<()> {
        self.running = true;
        self.state.lock().render_running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
        self.state.lock().render_running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn write_f32(&mut self, buffer: &[f32]) -> AudioResult<usize> {
        let mut state = self.state.lock();
        state.written_samples += buffer.len();
        state.last_f32 = buffer.last().copied();
        Ok(buffer.len())
    }

    fn write_i16(&mut self, buffer: &[i16]) -> AudioResult<usize> {
        let mut state = self.state.lock();
        state.written_samples += buffer.len();
        state.last_i16 = buffer.last().copied();
        Ok(buffer.len())
    }

    fn release_handle(&self) -> DeviceRelease {
        self.release.clone()
    }
}

/// A fixed, replaceable exclusion list.
#[derive(Default)]
pub struct FixedExclusions {
    uids: Mutex<Vec<i32>>,
}

impl FixedExclusions {
    pub fn new(uids: Vec<i32>) -> Self {
        Self {
            uids: Mutex::new(uids),
        }
    }

    pub fn set(&self, uids: Vec<i32>) {
        *self.uids.lock() = uids;
    }
}

impl ExclusionProvider for FixedExclusions {
    fn excluded_uids(&self) -> Vec<i32> {
        self.uids.lock().clone()
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
