//! Typed controller<->service messages for loopfx.
//!
//! This crate defines the message types exchanged between whatever drives
//! the processor service (a daemon, a UI shell) and the service itself.

mod commands;
mod events;
mod state;
mod types;

pub use commands::ServiceCommand;
pub use events::ServiceEvent;
pub use state::{ServiceState, StartupPhase, StopReason};
pub use types::{
    AudioEncoding, BlockedApp, DumpMethod, PipelineStats, ServiceConfig, SessionSummary,
    SessionUpdateMode,
};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for commands (controller → service).
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity for events (service → controller).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded command channel.
pub fn command_channel() -> (Sender<ServiceCommand>, Receiver<ServiceCommand>) {
    crossbeam_channel::bounded(COMMAND_CHANNEL_CAPACITY)
}

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<ServiceEvent>, Receiver<ServiceEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
