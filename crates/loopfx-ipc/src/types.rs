//! Common types used across service messages.

use serde::{Deserialize, Serialize};

/// PCM sample encoding of the capture and render streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioEncoding {
    /// Signed 16-bit samples.
    PcmShort,

    /// 32-bit float samples.
    #[default]
    PcmFloat,
}

impl AudioEncoding {
    /// Size of one sample in bytes.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::PcmShort => 2,
            Self::PcmFloat => 4,
        }
    }

    /// Returns the display name for this encoding.
    pub fn name(self) -> &'static str {
        match self {
            Self::PcmShort => "PCM 16-bit",
            Self::PcmFloat => "PCM float",
        }
    }
}

/// How the session registry learns about new sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionUpdateMode {
    /// Poll when the host reports playback or control-session changes.
    #[default]
    Listener,

    /// Poll on a fixed interval.
    ContinuousPolling,
}

/// Platform service queried for session dumps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DumpMethod {
    /// Policy service dump; also carries the capture allow/deny log.
    #[default]
    AudioPolicyService,

    /// Audio service dump; sessions only.
    AudioService,
}

impl DumpMethod {
    /// Stable numeric code used by persisted preferences.
    pub fn code(self) -> i32 {
        match self {
            Self::AudioPolicyService => 0,
            Self::AudioService => 1,
        }
    }

    /// Parses a persisted numeric code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::AudioPolicyService),
            1 => Some(Self::AudioService),
            _ => None,
        }
    }
}

/// An app the user excluded from capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedApp {
    /// Owning uid.
    pub uid: i32,

    /// Package name, if known.
    pub package_name: Option<String>,

    /// Display name, if known.
    pub app_name: Option<String>,
}

/// Configuration for starting the processor service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Sample encoding used by both devices.
    pub encoding: AudioEncoding,

    /// Capture buffer size in samples.
    pub buffer_size: usize,

    /// Stop the devices while no session is being muted.
    pub suspend_on_idle: bool,

    /// Exclude apps whose capture policy forbids recording.
    pub exclude_restricted: bool,

    /// Session loss retries before the service gives up.
    pub session_loss_max_retries: u32,

    /// Never react to session loss.
    pub ignore_session_loss: bool,

    /// Never stop because of an incompatible app.
    pub ignore_app_problems: bool,

    /// Session discovery mode.
    pub update_mode: SessionUpdateMode,

    /// Interval for continuous polling in milliseconds.
    pub polling_interval_ms: u64,

    /// Try other dump methods when the active one yields nothing.
    pub allow_dump_fallback: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            encoding: AudioEncoding::PcmFloat,
            buffer_size: 4096,
            suspend_on_idle: false,
            exclude_restricted: true,
            session_loss_max_retries: 1,
            ignore_session_loss: false,
            ignore_app_problems: false,
            update_mode: SessionUpdateMode::Listener,
            polling_interval_ms: 3000,
            allow_dump_fallback: true,
        }
    }
}

/// A muted session as reported to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Platform session id.
    pub session_id: i32,

    /// Owning uid.
    pub uid: i32,

    /// Owning package.
    pub package_name: String,

    /// Usage classification reported by the dump.
    pub usage: String,
}

/// Pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Buffers read, processed and written.
    pub buffers_processed: u64,

    /// Failed capture reads.
    pub read_errors: u64,

    /// Failed render writes.
    pub write_errors: u64,

    /// Capture device rebuilds.
    pub recreates: u64,

    /// Times the devices were stopped for idleness.
    pub idle_suspensions: u64,

    /// Pipeline uptime in seconds.
    pub uptime_seconds: u64,
}
