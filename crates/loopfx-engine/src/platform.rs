//! Host services the processor service is built on.

use std::sync::Arc;

use crossbeam_channel::Receiver;

use loopfx_audio::AudioHost;
use loopfx_dsp::{DspResult, EngineCallbacks, NativeEngine, PreferenceStore};
use loopfx_session::{EffectHost, HostNotification, PackageResolver, SessionDumpProvider};

/// Allocates a native engine for each service start.
pub type EngineFactory = Arc<dyn Fn() -> DspResult<Box<dyn NativeEngine>> + Send + Sync>;

/// Everything the service needs from the host.
#[derive(Clone)]
pub struct Platform {
    pub audio: Arc<dyn AudioHost>,
    pub effects: Arc<dyn EffectHost>,
    /// Tried in order when the active dump method falls back.
    pub dump_providers: Vec<Arc<dyn SessionDumpProvider>>,
    pub resolver: Arc<dyn PackageResolver>,
    pub engine_factory: EngineFactory,
    pub preferences: Arc<dyn PreferenceStore>,
    pub callbacks: Arc<dyn EngineCallbacks>,
    /// Host notifications; `crossbeam_channel::never()` if the host has none.
    pub notifications: Receiver<HostNotification>,
}
