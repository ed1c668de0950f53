//! Processor service for loopfx.
//!
//! This crate ties session tracking, the DSP engine and the capture
//! pipeline together behind a command/event interface.

mod context;
mod error;
mod exclusion;
mod platform;
mod retry;
mod service;

pub use context::AppContext;
pub use error::ServiceError;
pub use exclusion::{ExclusionState, MutedRegistry, ServiceExclusions};
pub use platform::{EngineFactory, Platform};
pub use retry::{RetryDecision, RetryPolicy, SessionLossRetry};
pub use service::ProcessorService;

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use loopfx_ipc::{ServiceCommand, ServiceEvent};

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Create a service instance with IPC channels.
pub fn create_service(
    platform: Platform,
    context: Arc<AppContext>,
    command_rx: Receiver<ServiceCommand>,
    event_tx: Sender<ServiceEvent>,
) -> ServiceResult<ProcessorService> {
    ProcessorService::new(platform, context, command_rx, event_tx)
}
