//! Capture/render devices and the processing loop.
//!
//! The host platform hands out a capture device that records every app's
//! playback except the excluded uids, and a render device for the processed
//! result. [`CapturePipeline`] runs the loop between them on its own thread.

mod device;
mod error;
mod metrics;
mod pipeline;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use device::{
    clamp_sample_rate, AudioHost, CaptureAuthorization, CaptureConfig, CaptureDevice,
    DeviceRelease, ExclusionProvider, RenderDevice, StreamFormat,
};
pub use error::AudioError;
pub use metrics::PipelineMetrics;
pub use pipeline::{
    CapturePipeline, PipelineContext, PipelineExit, IDLE_PARK_INTERVAL, SHUTDOWN_TIMEOUT,
};

/// Result type for audio operations.
pub type AudioResult<T> = Result<T, AudioError>;

/// Lowest supported sample rate in Hz.
pub const MIN_SAMPLE_RATE: u32 = 44_100;

/// Highest supported sample rate in Hz.
pub const MAX_SAMPLE_RATE: u32 = 48_000;

/// Sample rate used when the HAL does not report one.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Frames per buffer assumed when the HAL does not report one.
pub const DEFAULT_FRAMES_PER_BUFFER: u32 = 256;

/// Number of audio channels.
pub const CHANNELS: usize = 2;
