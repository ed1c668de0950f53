//! Host audio interfaces: stream format, capture authorization and devices.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use loopfx_ipc::AudioEncoding;

use crate::{AudioResult, CHANNELS, DEFAULT_SAMPLE_RATE, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE};

/// Clamp the HAL output rate into the supported range. Unknown rates use the default.
pub fn clamp_sample_rate(hal_rate: Option<u32>) -> u32 {
    match hal_rate {
        Some(rate) if rate > 0 => rate.clamp(MIN_SAMPLE_RATE, MAX_SAMPLE_RATE),
        _ => DEFAULT_SAMPLE_RATE,
    }
}

/// Negotiated PCM stream format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    /// Interleaved samples per buffer.
    pub buffer_samples: usize,
}

impl StreamFormat {
    pub fn new(encoding: AudioEncoding, hal_rate: Option<u32>, buffer_samples: usize) -> Self {
        Self {
            encoding,
            sample_rate: clamp_sample_rate(hal_rate),
            buffer_samples,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.encoding.bytes_per_sample()
    }

    /// Bytes per interleaved stereo frame.
    pub fn frame_bytes(&self) -> usize {
        self.bytes_per_sample() * CHANNELS
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_samples * self.bytes_per_sample()
    }

    /// Render buffer size. Sizes that are not a whole number of frames are
    /// rounded down to a multiple of 128 bytes.
    pub fn render_buffer_bytes(&self) -> usize {
        let bytes = self.buffer_bytes();
        if bytes < 1 || bytes % self.frame_bytes() != 0 {
            128 * (bytes / 128)
        } else {
            bytes
        }
    }
}

type RevocationListener = Box<dyn FnOnce() + Send>;

struct AuthorizationInner {
    valid: AtomicBool,
    listeners: Mutex<Vec<RevocationListener>>,
}

/// Token granting permission to capture other apps' playback.
///
/// Clones share the same token. Revocation is final.
#[derive(Clone)]
pub struct CaptureAuthorization {
    inner: Arc<AuthorizationInner>,
}

impl CaptureAuthorization {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AuthorizationInner {
                valid: AtomicBool::new(true),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::SeqCst)
    }

    /// Invalidate the token and notify listeners. Later calls do nothing.
    pub fn revoke(&self) {
        if !self.inner.valid.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Capture authorization revoked");
        let listeners = std::mem::take(&mut *self.inner.listeners.lock());
        for listener in listeners {
            listener();
        }
    }

    /// Run `f` once when the token is revoked, or right away if it already was.
    pub fn on_revoked(&self, f: impl FnOnce() + Send + 'static) {
        let mut listeners = self.inner.listeners.lock();
        if self.is_valid() {
            listeners.push(Box::new(f));
        } else {
            drop(listeners);
            debug!("Authorization already revoked, notifying immediately");
            f();
        }
    }
}

impl Default for CaptureAuthorization {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CaptureAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureAuthorization")
            .field("valid", &self.is_valid())
            .finish()
    }
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Frees a device's platform resources from any thread.
///
/// Clones share the same handle and the release runs at most once. On real
/// hosts releasing a device also wakes a read or write blocked on it.
#[derive(Clone)]
pub struct DeviceRelease {
    release: Arc<Mutex<Option<ReleaseFn>>>,
}

impl DeviceRelease {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Arc::new(Mutex::new(Some(Box::new(release)))),
        }
    }

    /// Release the device. Returns false if it was already released.
    pub fn release(&self) -> bool {
        let release = self.release.lock().take();
        match release {
            Some(release) => {
                release();
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.release.lock().is_none()
    }
}

impl std::fmt::Debug for DeviceRelease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRelease")
            .field("released", &self.is_released())
            .finish()
    }
}

/// Everything needed to build a capture device.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub format: StreamFormat,
    /// Uids whose playback must not be captured.
    pub excluded_uids: Vec<i32>,
    pub authorization: CaptureAuthorization,
}

/// Captures the mixed playback of all non-excluded apps.
pub trait CaptureDevice: Send {
    fn start(&mut self) -> AudioResult<()>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Blocking read. Returns the number of samples read.
    fn read_f32(&mut self, buffer: &mut [f32]) -> AudioResult<usize>;

    /// Blocking read. Returns the number of samples read.
    fn read_i16(&mut self, buffer: &mut [i16]) -> AudioResult<usize>;

    /// Handle releasing this device. Calls after release must not block.
    fn release_handle(&self) -> DeviceRelease;
}

/// Plays processed audio back to the output device.
pub trait RenderDevice: Send {
    fn start(&mut self) -> AudioResult<()>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Blocking write. Returns the number of samples written.
    fn write_f32(&mut self, buffer: &[f32]) -> AudioResult<usize>;

    /// Blocking write. Returns the number of samples written.
    fn write_i16(&mut self, buffer: &[i16]) -> AudioResult<usize>;

    /// Handle releasing this device. Calls after release must not block.
    fn release_handle(&self) -> DeviceRelease;
}

/// The platform's audio services.
pub trait AudioHost: Send + Sync {
    /// Native output sample rate, if the HAL reports one.
    fn output_sample_rate(&self) -> Option<u32>;

    /// Native frames per buffer, if the HAL reports one.
    fn frames_per_buffer(&self) -> Option<u32>;

    /// Ask for permission to capture. May require user interaction on real hosts.
    fn request_authorization(&self) -> AudioResult<CaptureAuthorization>;

    fn build_capture(&self, config: &CaptureConfig) -> AudioResult<Box<dyn CaptureDevice>>;

    fn build_render(
        &self,
        format: &StreamFormat,
        buffer_bytes: usize,
    ) -> AudioResult<Box<dyn RenderDevice>>;
}

/// Supplies the current capture exclusions each time a capture device is built.
pub trait ExclusionProvider: Send + Sync {
    fn excluded_uids(&self) -> Vec<i32>;
}
