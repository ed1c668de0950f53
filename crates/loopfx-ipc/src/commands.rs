//! Commands sent to the processor service.

use serde::{Deserialize, Serialize};

use crate::types::{AudioEncoding, BlockedApp, DumpMethod, ServiceConfig, SessionUpdateMode};

/// Commands that a controller can send to the processor service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceCommand {
    /// Start capturing and processing with the given configuration.
    Start { config: ServiceConfig },

    /// Stop the running service.
    Stop,

    /// DSP preferences changed; sync the namespaces that differ.
    PreferencesUpdated,

    /// Output sample rate changed; resync and reload the convolver.
    SampleRateUpdated,

    /// Reload the liveprog script without touching the devices.
    ReloadLiveprog,

    /// Tear down and rebuild the whole pipeline.
    HardReboot,

    /// Rebuild only the capture device on the next loop iteration.
    SoftReboot,

    /// Change sample encoding and buffer size (in samples). A running
    /// pipeline is rebuilt with the new format.
    SetStreamFormat {
        encoding: AudioEncoding,
        buffer_size: usize,
    },

    /// Replace the user blocklist.
    SetBlocklist(Vec<BlockedApp>),

    /// Toggle exclusion of apps whose capture policy forbids recording.
    SetExcludeRestricted(bool),

    /// Toggle stopping the devices while no session is active.
    SetSuspendOnIdle(bool),

    /// Switch the platform dump source.
    SetDumpMethod(DumpMethod),

    /// Switch between listener-driven and continuous session polling.
    SetSessionUpdateMode(SessionUpdateMode),

    /// Request a non-blocking session poll.
    PollSessions,

    /// Request current service state.
    GetState,

    /// Shutdown the service completely.
    Shutdown,
}
