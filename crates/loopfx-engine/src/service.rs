//! Processor service: owns every subsystem and reacts to commands.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::RwLock;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, instrument, warn};

use loopfx_audio::{
    clamp_sample_rate, AudioError, CaptureAuthorization, CapturePipeline, PipelineContext,
    PipelineExit, StreamFormat, DEFAULT_FRAMES_PER_BUFFER,
};
use loopfx_dsp::{EngineFacade, Namespace};
use loopfx_ipc::{
    AudioEncoding, DumpMethod, ServiceCommand, ServiceConfig, ServiceEvent, ServiceState, StartupPhase,
    StopReason,
};
use loopfx_session::{
    DumpManager, EventBus, MuteEffectFactory, MutedSessionBackend, PolicyUpdate, RegistryEvent,
    SessionInfo, SessionMap, SessionPoller, SessionPolicyTracker, SessionRegistry,
};

use crate::context::AppContext;
use crate::exclusion::{ExclusionState, MutedRegistry, ServiceExclusions};
use crate::platform::Platform;
use crate::retry::{RetryDecision, RetryPolicy, SessionLossRetry};
use crate::{ServiceError, ServiceResult};

const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STATS_INTERVAL: Duration = Duration::from_secs(5);
const RUNTIME_WORKER_THREADS: usize = 2;

/// Subsystems brought up by the startup phases.
#[derive(Default)]
struct Resources {
    authorization: Option<CaptureAuthorization>,
    facade: Option<Arc<EngineFacade>>,
    format: Option<StreamFormat>,
    policy: Option<Arc<SessionPolicyTracker>>,
    registry: Option<Arc<MutedRegistry>>,
    poller: Option<Arc<SessionPoller>>,
    exclusions: Option<Arc<ServiceExclusions>>,
    registry_rx: Option<Receiver<RegistryEvent>>,
    policy_rx: Option<Receiver<PolicyUpdate>>,
    pipeline: Option<CapturePipeline>,
}

/// The processor service.
pub struct ProcessorService {
    command_rx: Receiver<ServiceCommand>,
    event_tx: Sender<ServiceEvent>,
    platform: Platform,
    context: Arc<AppContext>,
    state: Arc<RwLock<ServiceState>>,
    runtime: Runtime,
    exclusions: Arc<ExclusionState>,
    config: ServiceConfig,
    dump_method: DumpMethod,
    resources: Resources,
    current_phase: Option<StartupPhase>,
    retry: SessionLossRetry,
    exit_tx: Sender<PipelineExit>,
    exit_rx: Receiver<PipelineExit>,
    last_stats: Instant,
}

impl ProcessorService {
    /// Create an idle service.
    pub fn new(
        platform: Platform,
        context: Arc<AppContext>,
        command_rx: Receiver<ServiceCommand>,
        event_tx: Sender<ServiceEvent>,
    ) -> ServiceResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(RUNTIME_WORKER_THREADS)
            .thread_name("loopfx-worker")
            .enable_all()
            .build()
            .map_err(ServiceError::Runtime)?;
        let (exit_tx, exit_rx) = crossbeam_channel::unbounded();

        Ok(Self {
            command_rx,
            event_tx,
            platform,
            context,
            state: Arc::new(RwLock::new(ServiceState::Idle)),
            runtime,
            exclusions: Arc::new(ExclusionState::default()),
            config: ServiceConfig::default(),
            dump_method: DumpMethod::default(),
            resources: Resources::default(),
            current_phase: None,
            retry: SessionLossRetry::default(),
            exit_tx,
            exit_rx,
            last_stats: Instant::now(),
        })
    }

    /// Shared view of the service state.
    pub fn state(&self) -> Arc<RwLock<ServiceState>> {
        Arc::clone(&self.state)
    }

    /// Run the service (blocking).
    #[instrument(name = "service_run", skip(self))]
    pub fn run(&mut self) {
        info!("Processor service starting");
        self.send_event(ServiceEvent::Ready);

        let command_rx = self.command_rx.clone();
        let exit_rx = self.exit_rx.clone();
        let notifications = self.platform.notifications.clone();

        loop {
            let registry_rx = self
                .resources
                .registry_rx
                .clone()
                .unwrap_or_else(crossbeam_channel::never);
            let policy_rx = self
                .resources
                .policy_rx
                .clone()
                .unwrap_or_else(crossbeam_channel::never);

            let keep_running = select! {
                recv(command_rx) -> command => match command {
                    Ok(command) => self.handle_command(command),
                    Err(_) => {
                        info!("Command channel disconnected, shutting down");
                        self.stop(StopReason::UserRequested);
                        false
                    }
                },
                recv(registry_rx) -> event => {
                    if let Ok(event) = event {
                        self.handle_registry_event(event);
                    }
                    true
                },
                recv(policy_rx) -> update => {
                    if let Ok(update) = update {
                        self.handle_policy_update(update);
                    }
                    true
                },
                recv(exit_rx) -> exit => {
                    if let Ok(exit) = exit {
                        self.handle_pipeline_exit(exit);
                    }
                    true
                },
                recv(notifications) -> notification => {
                    if let (Ok(notification), Some(poller)) = (notification, &self.resources.poller) {
                        poller.on_host_notification(notification);
                    }
                    true
                },
                default(COMMAND_POLL_INTERVAL) => true,
            };

            if !keep_running {
                break;
            }
            self.emit_stats_if_due();
        }

        info!("Processor service stopped");
    }

    /// Handle a command. Returns false if the service should exit.
    fn handle_command(&mut self, command: ServiceCommand) -> bool {
        debug!(?command, "Handling command");

        match command {
            ServiceCommand::Start { config } => self.start(config),
            ServiceCommand::Stop => self.stop(StopReason::UserRequested),
            ServiceCommand::PreferencesUpdated => self.sync_preferences(&[]),
            ServiceCommand::SampleRateUpdated => self.on_sample_rate_updated(),
            ServiceCommand::ReloadLiveprog => self.sync_preferences(&[Namespace::Liveprog]),
            ServiceCommand::HardReboot => self.restart_pipeline(),
            ServiceCommand::SoftReboot => self.request_recreate(),
            ServiceCommand::SetStreamFormat {
                encoding,
                buffer_size,
            } => self.set_stream_format(encoding, buffer_size),
            ServiceCommand::SetBlocklist(blocklist) => {
                if self.exclusions.set_blocklist(blocklist) {
                    self.request_recreate();
                }
            }
            ServiceCommand::SetExcludeRestricted(exclude) => {
                self.config.exclude_restricted = exclude;
                if self.exclusions.set_exclude_restricted(exclude) {
                    self.request_recreate();
                }
            }
            ServiceCommand::SetSuspendOnIdle(suspend) => {
                self.config.suspend_on_idle = suspend;
                if let Some(pipeline) = &self.resources.pipeline {
                    pipeline.set_suspend_on_idle(suspend);
                }
            }
            ServiceCommand::SetDumpMethod(method) => self.set_dump_method(method),
            ServiceCommand::SetSessionUpdateMode(mode) => {
                self.config.update_mode = mode;
                if let Some(poller) = &self.resources.poller {
                    poller.set_mode(mode, self.polling_interval());
                }
            }
            ServiceCommand::PollSessions => {
                if let Some(poller) = &self.resources.poller {
                    poller.poll_in_background();
                }
            }
            ServiceCommand::GetState => self.send_state(),
            ServiceCommand::Shutdown => {
                self.stop(StopReason::UserRequested);
                self.send_event(ServiceEvent::Shutdown);
                return false;
            }
        }

        true
    }

    /// Start capturing.
    #[instrument(name = "start_service", skip(self, config))]
    fn start(&mut self, config: ServiceConfig) {
        // Idempotent: ignore if already starting or running
        {
            let state = self.state.read();
            if state.is_starting() || state.is_running() {
                debug!("Already starting or running, ignoring start command");
                return;
            }
        }

        info!(
            encoding = config.encoding.name(),
            buffer_size = config.buffer_size,
            "Starting processor service"
        );
        self.exclusions
            .set_exclude_restricted(config.exclude_restricted);
        self.retry = SessionLossRetry::new(RetryPolicy {
            max_attempts: config.session_loss_max_retries,
        });
        self.config = config;

        match self.initialize(StartupPhase::StartPipeline) {
            Ok(()) => {
                let active = self.context.service_started();
                let sessions = self.resources.registry.as_ref().map_or(0, |r| r.len());
                self.transition_to(ServiceState::Running {
                    config: self.config.clone(),
                    sessions,
                });
                self.last_stats = Instant::now();
                info!(active_services = active, "Processor service started");
            }
            Err(e) => {
                error!("Service start failed: {}", e);
                self.rollback();

                if is_authorization_error(&e) {
                    self.send_event(ServiceEvent::CaptureAuthorizationRevoked);
                    self.transition_to(ServiceState::Idle);
                } else {
                    self.transition_to(ServiceState::Error {
                        message: e.to_string(),
                        recoverable: true,
                    });
                }
            }
        }
    }

    /// Initialize phases up to and including `target`.
    fn initialize(&mut self, target: StartupPhase) -> ServiceResult<()> {
        let mut phase = StartupPhase::AcquireAuthorization;

        loop {
            self.current_phase = Some(phase);
            self.transition_to(ServiceState::Starting { phase });
            self.init_phase(phase)?;

            if phase == target {
                break;
            }
            match phase.next() {
                Some(next) => phase = next,
                None => break,
            }
        }

        Ok(())
    }

    fn init_phase(&mut self, phase: StartupPhase) -> ServiceResult<()> {
        info!("Initializing phase: {}", phase.name());

        match phase {
            StartupPhase::AcquireAuthorization => self.acquire_authorization(),
            StartupPhase::ConfigureEngine => self.configure_engine(),
            StartupPhase::TrackSessions => self.track_sessions(),
            StartupPhase::StartPipeline => self.start_pipeline(),
        }
    }

    fn acquire_authorization(&mut self) -> ServiceResult<()> {
        let authorization = self.platform.audio.request_authorization()?;
        self.resources.authorization = Some(authorization);
        debug!("Capture authorization acquired");
        Ok(())
    }

    fn configure_engine(&mut self) -> ServiceResult<()> {
        let engine = (self.platform.engine_factory)()?;
        let facade = Arc::new(EngineFacade::new(
            engine,
            Arc::clone(&self.platform.preferences),
            Arc::clone(&self.platform.callbacks),
        ));

        let format = self.stream_format();
        info!(
            sample_rate = format.sample_rate,
            frames_per_buffer = self
                .platform
                .audio
                .frames_per_buffer()
                .unwrap_or(DEFAULT_FRAMES_PER_BUFFER),
            "Stream format negotiated"
        );
        facade.set_sample_rate(format.sample_rate)?;

        let report = facade.sync_with_preferences(&[])?;
        debug!(
            applied = report.applied.len(),
            failed = report.failed.len(),
            "Initial preference sync"
        );

        self.resources.facade = Some(facade);
        self.resources.format = Some(format);
        Ok(())
    }

    fn track_sessions(&mut self) -> ServiceResult<()> {
        let own_package = self.context.own_package().to_string();

        let policy = Arc::new(SessionPolicyTracker::new(
            own_package.clone(),
            Arc::clone(&self.platform.resolver),
        ));

        let dumps = Arc::new(DumpManager::new(
            self.platform.dump_providers.clone(),
            self.dump_method,
        ));
        dumps.set_allow_fallback(self.config.allow_dump_fallback);

        let factory = MuteEffectFactory::new(Arc::clone(&self.platform.effects));
        if !factory.is_device_compatible() {
            warn!("No mute effect type is available, sessions cannot be muted");
        }
        let events = EventBus::new();
        let backend = MutedSessionBackend::new(factory, events.clone());
        let registry = Arc::new(SessionRegistry::new(
            self.context.own_uid(),
            own_package,
            backend,
            events,
        ));

        let poller = Arc::new(SessionPoller::new(
            dumps,
            registry.clone(),
            Arc::clone(&policy),
            self.runtime.handle().clone(),
        ));

        let exclusions = Arc::new(ServiceExclusions {
            context: Arc::clone(&self.context),
            state: Arc::clone(&self.exclusions),
            policy: Arc::clone(&policy),
            registry: Arc::clone(&registry),
            poller: Arc::clone(&poller),
        });

        self.resources.registry_rx = Some(registry.subscribe());
        self.resources.policy_rx = Some(policy.subscribe());

        registry.set_excluded_uids(exclusions.compute());
        poller.start(self.config.update_mode, self.polling_interval());
        poller.poll_blocking();
        debug!(sessions = registry.len(), "Session tracking started");

        self.resources.policy = Some(policy);
        self.resources.registry = Some(registry);
        self.resources.poller = Some(poller);
        self.resources.exclusions = Some(exclusions);
        Ok(())
    }

    fn start_pipeline(&mut self) -> ServiceResult<()> {
        let ctx = self.pipeline_context()?;
        let pipeline = CapturePipeline::start(ctx, self.config.suspend_on_idle, self.exit_tx.clone())?;

        let idle = self.resources.registry.as_ref().map_or(true, |r| r.is_empty());
        pipeline.set_idle(idle);
        self.resources.pipeline = Some(pipeline);
        Ok(())
    }

    fn pipeline_context(&self) -> ServiceResult<PipelineContext> {
        let resources = &self.resources;
        Ok(PipelineContext {
            host: Arc::clone(&self.platform.audio),
            facade: resources
                .facade
                .clone()
                .ok_or(ServiceError::MissingResource("engine"))?,
            exclusions: resources
                .exclusions
                .clone()
                .ok_or(ServiceError::MissingResource("exclusions"))?,
            authorization: resources
                .authorization
                .clone()
                .ok_or(ServiceError::MissingResource("authorization"))?,
            format: resources
                .format
                .ok_or(ServiceError::MissingResource("stream format"))?,
        })
    }

    /// Rollback phases from the current one backwards.
    #[instrument(name = "rollback_service", skip(self))]
    fn rollback(&mut self) {
        if let Some(mut phase) = self.current_phase.take() {
            loop {
                info!("Rolling back phase: {}", phase.name());
                self.rollback_phase(phase);

                match phase.previous() {
                    Some(previous) => phase = previous,
                    None => break,
                }
            }
        }
    }

    fn rollback_phase(&mut self, phase: StartupPhase) {
        let resources = &mut self.resources;

        match phase {
            StartupPhase::StartPipeline => {
                if let Some(pipeline) = resources.pipeline.take() {
                    pipeline.stop();
                }
            }
            StartupPhase::TrackSessions => {
                if let Some(poller) = resources.poller.take() {
                    poller.stop();
                }
                resources.exclusions = None;
                if let Some(registry) = resources.registry.take() {
                    registry.destroy();
                }
                if let Some(policy) = resources.policy.take() {
                    policy.destroy();
                }
                resources.registry_rx = None;
                resources.policy_rx = None;
            }
            StartupPhase::ConfigureEngine => {
                // Freed only once the pipeline no longer calls into it.
                if let Some(facade) = resources.facade.take() {
                    facade.release();
                }
                resources.format = None;
            }
            StartupPhase::AcquireAuthorization => {
                resources.authorization = None;
            }
        }
    }

    /// Stop capturing.
    #[instrument(name = "stop_service", skip(self))]
    fn stop(&mut self, reason: StopReason) {
        // Idempotent: ignore if already idle or stopping
        let was_running = {
            let state = self.state.read();
            if state.is_idle() || state.is_stopping() {
                debug!("Already idle or stopping, ignoring stop");
                return;
            }
            state.is_running()
        };

        info!(reason = %reason.message(), "Stopping processor service");
        self.transition_to(ServiceState::Stopping { reason });

        self.rollback();
        self.retry.reset();

        if was_running {
            let active = self.context.service_stopped();
            debug!(active_services = active, "Service count updated");
        }

        self.transition_to(ServiceState::Idle);
        info!("Processor service stopped");
    }

    /// Stop and restart the pipeline with a freshly negotiated format.
    #[instrument(name = "restart_pipeline", skip(self))]
    fn restart_pipeline(&mut self) {
        if !self.state.read().is_running() {
            debug!("Not running, ignoring restart");
            return;
        }
        info!("Restarting capture pipeline");

        if let Some(pipeline) = self.resources.pipeline.take() {
            pipeline.stop();
        }

        let result = self.refresh_format().and_then(|()| self.start_pipeline());
        if let Err(e) = result {
            error!("Pipeline restart failed: {}", e);
            self.fail(e);
        }
    }

    fn set_stream_format(&mut self, encoding: AudioEncoding, buffer_size: usize) {
        if buffer_size == 0 {
            warn!("Ignoring empty buffer size");
            return;
        }
        if self.config.encoding == encoding && self.config.buffer_size == buffer_size {
            debug!("Stream format unchanged");
            return;
        }
        info!(encoding = encoding.name(), buffer_size, "Stream format changed");
        self.config.encoding = encoding;
        self.config.buffer_size = buffer_size;
        if let ServiceState::Running { config, .. } = &mut *self.state.write() {
            config.encoding = encoding;
            config.buffer_size = buffer_size;
        }
        self.restart_pipeline();
    }

    fn refresh_format(&mut self) -> ServiceResult<()> {
        let format = self.stream_format();
        if let Some(facade) = &self.resources.facade {
            if facade.sample_rate() != format.sample_rate {
                facade.set_sample_rate(format.sample_rate)?;
            }
        }
        self.resources.format = Some(format);
        Ok(())
    }

    fn request_recreate(&self) {
        if let Some(pipeline) = &self.resources.pipeline {
            pipeline.request_recreate();
        }
    }

    fn on_sample_rate_updated(&mut self) {
        let Some(facade) = self.resources.facade.clone() else {
            return;
        };
        let sample_rate = clamp_sample_rate(self.platform.audio.output_sample_rate());
        if sample_rate != facade.sample_rate() {
            if let Err(e) = facade.set_sample_rate(sample_rate) {
                warn!("Failed to update sample rate: {}", e);
            }
        }
        self.sync_preferences(&[Namespace::Convolver]);
    }

    /// Push preferences into the engine off the service thread.
    fn sync_preferences(&self, force: &[Namespace]) {
        let Some(facade) = self.resources.facade.clone() else {
            debug!("Engine not configured, skipping preference sync");
            return;
        };
        let force = force.to_vec();
        self.runtime.spawn_blocking(move || {
            match facade.sync_with_preferences(&force) {
                Ok(report) => debug!(
                    applied = report.applied.len(),
                    failed = report.failed.len(),
                    "Preferences synced"
                ),
                Err(e) => warn!("Preference sync failed: {}", e),
            }
        });
    }

    fn set_dump_method(&mut self, method: DumpMethod) {
        self.dump_method = method;
        let Some(poller) = &self.resources.poller else {
            return;
        };
        if let Err(e) = poller.change_dump_method(method) {
            warn!(?method, "Failed to change dump method: {}", e);
            self.send_event(ServiceEvent::Error {
                recoverable: true,
                message: e.to_string(),
            });
        }
    }

    fn handle_registry_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Changed(sessions) => self.on_sessions_changed(&sessions),
            RegistryEvent::AppProblem(session) => self.on_app_problem(session),
            RegistryEvent::SessionLost(session) => self.on_session_lost(session),
        }
    }

    fn on_sessions_changed(&mut self, sessions: &SessionMap) {
        if let Some(pipeline) = &self.resources.pipeline {
            pipeline.set_idle(sessions.is_empty());
        }
        if let ServiceState::Running { sessions: count, .. } = &mut *self.state.write() {
            *count = sessions.len();
        }
        let summaries = sessions.values().map(SessionInfo::to_summary).collect();
        self.send_event(ServiceEvent::SessionsChanged(summaries));
    }

    fn on_app_problem(&mut self, session: SessionInfo) {
        if !self.state.read().is_running() {
            return;
        }
        if self.config.ignore_app_problems {
            debug!(uid = session.uid, "Ignoring app problem");
            return;
        }

        warn!(uid = session.uid, package = %session.package_name, "App cannot be muted");
        self.send_event(ServiceEvent::AppProblemDetected {
            uid: session.uid,
            package_name: session.package_name,
        });
        self.stop(StopReason::AppIncompatible { uid: session.uid });
    }

    fn on_session_lost(&mut self, session: SessionInfo) {
        if !self.state.read().is_running() {
            return;
        }

        match self.retry.on_session_lost(self.config.ignore_session_loss) {
            RetryDecision::Ignore => {
                debug!(uid = session.uid, "Ignoring session loss");
            }
            RetryDecision::Retry { attempt } => {
                info!(attempt, uid = session.uid, "Session lost, rebuilding");
                if let Some(registry) = &self.resources.registry {
                    registry.clear_sessions();
                }
                if let Some(poller) = &self.resources.poller {
                    poller.poll_blocking();
                }
                self.restart_pipeline();
            }
            RetryDecision::GiveUp => {
                warn!(uid = session.uid, package = %session.package_name, "Session lost, giving up");
                self.send_event(ServiceEvent::SessionLost {
                    uid: session.uid,
                    package_name: session.package_name,
                });
                self.stop(StopReason::SessionLost { uid: session.uid });
            }
        }
    }

    fn handle_policy_update(&mut self, update: PolicyUpdate) {
        if update.is_minor_update || !self.exclusions.exclude_restricted() {
            return;
        }
        info!(
            packages = update.entries.len(),
            "Restricted apps changed, rebuilding capture"
        );
        self.request_recreate();
    }

    fn handle_pipeline_exit(&mut self, exit: PipelineExit) {
        if !self.state.read().is_running() {
            debug!(?exit, "Pipeline exit while not running");
            return;
        }

        match exit {
            PipelineExit::Disposed => debug!("Pipeline disposed"),
            PipelineExit::AuthorizationRevoked => {
                warn!("Capture authorization revoked, stopping");
                self.send_event(ServiceEvent::CaptureAuthorizationRevoked);
                self.stop(StopReason::AuthorizationRevoked);
            }
            PipelineExit::Fatal(message) => {
                error!("Pipeline failed: {}", message);
                self.send_event(ServiceEvent::Error {
                    recoverable: true,
                    message: message.clone(),
                });
                self.stop(StopReason::PipelineFailed { message });
            }
        }
    }

    /// Report and stop after a failure while running.
    fn fail(&mut self, e: ServiceError) {
        if is_authorization_error(&e) {
            self.send_event(ServiceEvent::CaptureAuthorizationRevoked);
            self.stop(StopReason::AuthorizationRevoked);
        } else {
            let message = e.to_string();
            self.send_event(ServiceEvent::Error {
                recoverable: true,
                message: message.clone(),
            });
            self.stop(StopReason::PipelineFailed { message });
        }
    }

    fn stream_format(&self) -> StreamFormat {
        StreamFormat::new(
            self.config.encoding,
            self.platform.audio.output_sample_rate(),
            self.config.buffer_size,
        )
    }

    fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.config.polling_interval_ms)
    }

    fn emit_stats_if_due(&mut self) {
        if self.last_stats.elapsed() < STATS_INTERVAL {
            return;
        }
        self.last_stats = Instant::now();
        if let Some(pipeline) = &self.resources.pipeline {
            self.send_event(ServiceEvent::Stats(pipeline.stats()));
        }
    }

    fn send_state(&self) {
        let state = self.state.read().clone();
        self.send_event(ServiceEvent::StateChanged {
            previous: Box::new(state.clone()),
            current: Box::new(state),
        });
    }

    fn transition_to(&self, new_state: ServiceState) {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, new_state.clone())
        };

        debug!(
            previous = %previous.name(),
            current = %new_state.name(),
            "State transition"
        );

        self.send_event(ServiceEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(new_state),
        });
    }

    fn send_event(&self, event: ServiceEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

impl Drop for ProcessorService {
    fn drop(&mut self) {
        self.rollback();
    }
}

fn is_authorization_error(e: &ServiceError) -> bool {
    matches!(
        e,
        ServiceError::Audio(AudioError::AuthorizationDenied(_) | AudioError::AuthorizationRevoked)
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::thread::{self, JoinHandle};

    use parking_lot::Mutex;

    use loopfx_audio::testing::{wait_until, MockAudioHost, CAPTURED_F32, CAPTURED_I16};
    use loopfx_dsp::testing::{MockEngine, MockEngineState};
    use loopfx_dsp::{LoggingCallbacks, MemoryPreferences, NativeEngine};
    use loopfx_ipc::BlockedApp;
    use loopfx_session::testing::{MapResolver, MockEffectHost, StaticDumpProvider};
    use loopfx_session::{EffectStatus, EffectType, HostNotification, SessionDump, SessionDumpEntry};

    use super::*;

    const OWN_UID: i32 = 10001;
    const TIMEOUT: Duration = Duration::from_secs(3);

    type EngineStates = Arc<Mutex<Vec<Arc<Mutex<MockEngineState>>>>>;

    struct Fixture {
        audio: MockAudioHost,
        effects: Arc<MockEffectHost>,
        dumps: Arc<StaticDumpProvider>,
        resolver: Arc<MapResolver>,
        prefs: Arc<MemoryPreferences>,
        engines: EngineStates,
        context: Arc<AppContext>,
        notify_tx: Sender<HostNotification>,
        command_tx: Sender<ServiceCommand>,
        event_rx: Receiver<ServiceEvent>,
        state: Arc<RwLock<ServiceState>>,
        handle: Option<JoinHandle<()>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_effects(MockEffectHost::new())
        }

        fn with_effects(effects: MockEffectHost) -> Self {
            let audio = MockAudioHost::new();
            let effects = Arc::new(effects);
            let dumps = Arc::new(StaticDumpProvider::new(DumpMethod::AudioPolicyService));
            let resolver = Arc::new(MapResolver::default());
            let prefs = Arc::new(MemoryPreferences::new());
            let engines: EngineStates = Arc::new(Mutex::new(Vec::new()));
            let context = Arc::new(AppContext::new(OWN_UID, "me.loopfx"));
            let (notify_tx, notify_rx) = crossbeam_channel::unbounded();

            let factory_engines = Arc::clone(&engines);
            let platform = Platform {
                audio: Arc::new(audio.clone()),
                effects: effects.clone(),
                dump_providers: vec![dumps.clone()],
                resolver: resolver.clone(),
                engine_factory: Arc::new(move || {
                    let (engine, state) = MockEngine::new();
                    factory_engines.lock().push(state);
                    Ok(Box::new(engine) as Box<dyn NativeEngine>)
                }),
                preferences: prefs.clone(),
                callbacks: Arc::new(LoggingCallbacks),
                notifications: notify_rx,
            };

            let (command_tx, command_rx) = loopfx_ipc::command_channel();
            let (event_tx, event_rx) = crossbeam_channel::unbounded();
            let mut service =
                ProcessorService::new(platform, Arc::clone(&context), command_rx, event_tx).unwrap();
            let state = service.state();
            let handle = thread::spawn(move || service.run());

            Self {
                audio,
                effects,
                dumps,
                resolver,
                prefs,
                engines,
                context,
                notify_tx,
                command_tx,
                event_rx,
                state,
                handle: Some(handle),
            }
        }

        fn send(&self, command: ServiceCommand) {
            self.command_tx.send(command).unwrap();
        }

        fn start(&self, config: ServiceConfig) {
            self.send(ServiceCommand::Start { config });
        }

        fn start_and_wait(&self, config: ServiceConfig) {
            self.start(config);
            assert!(self.wait_for(|s| s.is_running()), "service did not start");
        }

        fn wait_for(&self, condition: impl Fn(&ServiceState) -> bool) -> bool {
            wait_until(TIMEOUT, || condition(&self.state.read()))
        }

        fn engine(&self) -> Arc<Mutex<MockEngineState>> {
            self.engines.lock().last().cloned().unwrap()
        }

        /// Wait until every command sent so far has been handled.
        fn barrier(&self) {
            while self.event_rx.try_recv().is_ok() {}
            self.send(ServiceCommand::GetState);
            assert!(self.wait_event(|e| matches!(e, ServiceEvent::StateChanged { .. })));
        }

        /// Collect events until one matches `condition`.
        fn wait_event(&self, condition: impl Fn(&ServiceEvent) -> bool) -> bool {
            let deadline = Instant::now() + TIMEOUT;
            while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
                match self.event_rx.recv_timeout(remaining) {
                    Ok(event) if condition(&event) => return true,
                    Ok(_) => {}
                    Err(_) => return false,
                }
            }
            false
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = self.command_tx.send(ServiceCommand::Shutdown);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn media(uid: i32, package: &str) -> SessionDumpEntry {
        SessionDumpEntry::new(uid, package, "USAGE_MEDIA")
    }

    fn single_session() -> SessionDump {
        SessionDump::new().with_session(1, media(10100, "com.music"))
    }

    #[test]
    fn test_start_mutes_sessions_and_processes_audio() {
        let f = Fixture::new();
        f.dumps.set_dump(single_session());

        f.start_and_wait(ServiceConfig::default());
        assert_eq!(f.context.active_services(), 1);

        let effect = f.effects.instance(1).unwrap();
        assert!(effect.is_enabled());
        assert!(wait_until(TIMEOUT, || {
            f.audio.state().lock().last_f32 == Some(CAPTURED_F32 / 2.0)
        }));
        assert!(f.engine().lock().stages.contains_key("output"));

        f.send(ServiceCommand::Stop);
        assert!(f.wait_for(|s| s.is_idle()));
        assert!(effect.is_released());
        assert_eq!(f.engine().lock().freed, 1);
        let host = f.audio.state().lock();
        assert_eq!(host.captures_released, 1);
        assert_eq!(host.renders_released, 1);
        drop(host);
        assert_eq!(f.context.active_services(), 0);
    }

    #[test]
    fn test_running_state_reports_session_count() {
        let f = Fixture::new();
        f.dumps.set_dump(
            single_session().with_session(2, media(10200, "com.video")),
        );

        f.start_and_wait(ServiceConfig::default());
        assert!(f.wait_for(|s| matches!(s, ServiceState::Running { sessions: 2, .. })));
    }

    #[test]
    fn test_start_is_idempotent() {
        let f = Fixture::new();
        f.start_and_wait(ServiceConfig::default());
        f.start(ServiceConfig::default());
        f.barrier();
        assert_eq!(f.engines.lock().len(), 1);
        assert_eq!(f.context.active_services(), 1);
    }

    #[test]
    fn test_empty_dump_releases_sessions() {
        let f = Fixture::new();
        f.dumps.set_dump(single_session());
        f.start_and_wait(ServiceConfig::default());
        let effect = f.effects.instance(1).unwrap();

        f.dumps.set_dump(SessionDump::new());
        f.send(ServiceCommand::PollSessions);

        assert!(wait_until(TIMEOUT, || effect.is_released()));
        assert!(f.wait_event(|e| matches!(e, ServiceEvent::SessionsChanged(s) if s.is_empty())));
    }

    #[test]
    fn test_own_uid_is_never_muted() {
        let f = Fixture::new();
        f.dumps
            .set_dump(SessionDump::new().with_session(2, media(OWN_UID, "me.loopfx")));

        f.start_and_wait(ServiceConfig::default());

        assert_eq!(f.effects.created_count(), 0);
        assert!(f.audio.state().lock().capture_builds[0].contains(&OWN_UID));
    }

    #[test]
    fn test_blocklist_rebuilds_capture_and_releases_session() {
        let f = Fixture::new();
        f.dumps.set_dump(single_session());
        f.start_and_wait(ServiceConfig::default());
        let effect = f.effects.instance(1).unwrap();

        f.send(ServiceCommand::SetBlocklist(vec![BlockedApp {
            uid: 10100,
            package_name: Some("com.music".into()),
            app_name: None,
        }]));

        assert!(wait_until(TIMEOUT, || {
            let host = f.audio.state().lock();
            host.capture_builds.len() == 2 && host.capture_builds[1].contains(&10100)
        }));
        assert!(wait_until(TIMEOUT, || effect.is_released()));
    }

    #[test]
    fn test_unchanged_blocklist_keeps_capture() {
        let f = Fixture::new();
        f.start_and_wait(ServiceConfig::default());

        f.send(ServiceCommand::SetBlocklist(Vec::new()));
        f.barrier();
        assert_eq!(f.audio.state().lock().capture_builds.len(), 1);
    }

    #[test]
    fn test_restricted_app_change_rebuilds_capture() {
        let f = Fixture::new();
        f.resolver.insert("com.secret", 100);
        f.dumps
            .set_allowlist(HashMap::from([("com.secret".to_string(), true)]));
        f.start_and_wait(ServiceConfig::default());
        assert!(!f.audio.state().lock().capture_builds[0].contains(&100));

        f.dumps
            .set_allowlist(HashMap::from([("com.secret".to_string(), false)]));
        f.send(ServiceCommand::PollSessions);

        assert!(wait_until(TIMEOUT, || {
            let host = f.audio.state().lock();
            host.capture_builds.len() >= 2 && host.capture_builds.last().unwrap().contains(&100)
        }));
    }

    #[test]
    fn test_restricted_apps_are_captured_when_not_excluded() {
        let f = Fixture::new();
        f.resolver.insert("com.secret", 100);
        f.dumps
            .set_allowlist(HashMap::from([("com.secret".to_string(), false)]));

        f.start_and_wait(ServiceConfig {
            exclude_restricted: false,
            ..ServiceConfig::default()
        });

        assert!(!f.audio.state().lock().capture_builds[0].contains(&100));
    }

    #[test]
    fn test_app_problem_stops_service() {
        let f = Fixture::with_effects(MockEffectHost::with_types(&[]));
        f.dumps.set_dump(single_session());

        f.start(ServiceConfig::default());

        assert!(f.wait_event(|e| matches!(e, ServiceEvent::AppProblemDetected { uid: 10100, .. })));
        assert!(f.wait_for(|s| s.is_idle()));
        assert_eq!(f.context.active_services(), 0);
    }

    #[test]
    fn test_ignored_app_problem_keeps_running() {
        let f = Fixture::with_effects(MockEffectHost::with_types(&[EffectType::Volume]));
        f.effects.fail_creation_of(EffectType::Volume);
        f.dumps.set_dump(single_session());

        f.start_and_wait(ServiceConfig {
            ignore_app_problems: true,
            ..ServiceConfig::default()
        });
        f.send(ServiceCommand::PollSessions);
        f.barrier();

        assert!(f.state.read().is_running());
    }

    #[test]
    fn test_session_loss_retries_then_gives_up() {
        let f = Fixture::new();
        f.dumps.set_dump(single_session());
        f.start_and_wait(ServiceConfig::default());

        f.effects.instance(1).unwrap().fire(EffectStatus::ControlLost);
        assert!(wait_until(TIMEOUT, || {
            f.effects.created_count() == 2 && f.audio.state().lock().render_builds.len() == 2
        }));
        assert!(f.state.read().is_running());

        f.effects.instance(1).unwrap().fire(EffectStatus::ControlLost);
        assert!(f.wait_event(|e| matches!(e, ServiceEvent::SessionLost { uid: 10100, .. })));
        assert!(f.wait_for(|s| s.is_idle()));
    }

    #[test]
    fn test_ignored_session_loss_keeps_running() {
        let f = Fixture::new();
        f.dumps.set_dump(single_session());
        f.start_and_wait(ServiceConfig {
            ignore_session_loss: true,
            ..ServiceConfig::default()
        });

        f.effects.instance(1).unwrap().fire(EffectStatus::ControlLost);
        f.barrier();

        assert_eq!(f.audio.state().lock().render_builds.len(), 1);
    }

    #[test]
    fn test_revoked_authorization_stops_service() {
        let f = Fixture::new();
        f.start_and_wait(ServiceConfig::default());

        f.audio.authorization().unwrap().revoke();

        assert!(f.wait_event(|e| matches!(e, ServiceEvent::CaptureAuthorizationRevoked)));
        assert!(f.wait_for(|s| s.is_idle()));
        assert_eq!(f.engine().lock().freed, 1);
    }

    #[test]
    fn test_denied_authorization_returns_to_idle() {
        let f = Fixture::new();
        f.audio.state().lock().deny_authorization = true;

        f.start(ServiceConfig::default());

        assert!(f.wait_event(|e| matches!(e, ServiceEvent::CaptureAuthorizationRevoked)));
        assert!(f.wait_for(|s| s.is_idle()));
        assert!(f.engines.lock().is_empty());
    }

    #[test]
    fn test_start_failure_rolls_back() {
        let f = Fixture::new();
        f.dumps.set_dump(single_session());
        f.audio.state().lock().fail_render_builds = true;

        f.start(ServiceConfig::default());

        assert!(f.wait_for(|s| s.is_error()));
        assert_eq!(f.engine().lock().freed, 1);
        assert!(f.effects.instance(1).unwrap().is_released());
        assert_eq!(f.audio.state().lock().captures_released, 1);
        assert_eq!(f.context.active_services(), 0);
    }

    #[test]
    fn test_preferences_update_syncs_engine() {
        let f = Fixture::new();
        f.start_and_wait(ServiceConfig::default());

        f.prefs.set(Namespace::Bass.key(), "enable", true);
        f.prefs.set(Namespace::Bass.key(), "maxgain", 9.0f32);
        f.send(ServiceCommand::PreferencesUpdated);

        let engine = f.engine();
        assert!(wait_until(TIMEOUT, || engine.lock().bass_gain == Some(9.0)));
        assert_eq!(engine.lock().stages.get("bass"), Some(&true));
    }

    #[test]
    fn test_reload_liveprog_reapplies_stage() {
        let f = Fixture::new();
        f.start_and_wait(ServiceConfig::default());
        let engine = f.engine();
        let count = || engine.lock().calls.iter().filter(|c| **c == "liveprog").count();
        let before = count();

        f.send(ServiceCommand::ReloadLiveprog);

        assert!(wait_until(TIMEOUT, || count() == before + 1));
    }

    #[test]
    fn test_sample_rate_update_reconfigures_engine() {
        let f = Fixture::new();
        f.start_and_wait(ServiceConfig::default());
        let engine = f.engine();
        assert_eq!(engine.lock().sample_rate, Some(48_000.0));
        let convolver = || engine.lock().calls.iter().filter(|c| **c == "convolver").count();
        let before = convolver();

        f.audio.state().lock().sample_rate = Some(44_100);
        f.send(ServiceCommand::SampleRateUpdated);

        assert!(wait_until(TIMEOUT, || convolver() == before + 1));
        assert_eq!(engine.lock().sample_rate, Some(44_100.0));
    }

    #[test]
    fn test_hard_reboot_rebuilds_devices() {
        let f = Fixture::new();
        f.start_and_wait(ServiceConfig::default());

        f.send(ServiceCommand::HardReboot);

        assert!(wait_until(TIMEOUT, || f.audio.state().lock().render_builds.len() == 2));
        assert!(f.state.read().is_running());
        assert_eq!(f.engine().lock().freed, 0);
    }

    #[test]
    fn test_stream_format_change_rebuilds_pipeline() {
        let f = Fixture::new();
        f.start_and_wait(ServiceConfig::default());
        assert_eq!(f.audio.state().lock().render_builds, vec![4096 * 4]);

        f.send(ServiceCommand::SetStreamFormat {
            encoding: AudioEncoding::PcmShort,
            buffer_size: 2048,
        });

        assert!(wait_until(TIMEOUT, || f.audio.state().lock().render_builds.len() == 2));
        assert_eq!(f.audio.state().lock().render_builds[1], 2048 * 2);
        assert_eq!(f.audio.state().lock().capture_builds.len(), 2);
        assert!(wait_until(TIMEOUT, || {
            f.audio.state().lock().last_i16 == Some(CAPTURED_I16 / 2)
        }));
        match &*f.state.read() {
            ServiceState::Running { config, .. } => {
                assert_eq!(config.encoding, AudioEncoding::PcmShort);
                assert_eq!(config.buffer_size, 2048);
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(f.engine().lock().freed, 0);
    }

    #[test]
    fn test_unchanged_stream_format_keeps_pipeline() {
        let f = Fixture::new();
        let config = ServiceConfig::default();
        f.start_and_wait(config.clone());

        f.send(ServiceCommand::SetStreamFormat {
            encoding: config.encoding,
            buffer_size: config.buffer_size,
        });
        f.barrier();

        assert_eq!(f.audio.state().lock().render_builds.len(), 1);
    }

    #[test]
    fn test_soft_reboot_rebuilds_capture_only() {
        let f = Fixture::new();
        f.start_and_wait(ServiceConfig::default());

        f.send(ServiceCommand::SoftReboot);

        assert!(wait_until(TIMEOUT, || f.audio.state().lock().capture_builds.len() == 2));
        assert_eq!(f.audio.state().lock().render_builds.len(), 1);
    }

    #[test]
    fn test_listener_notification_triggers_poll() {
        let f = Fixture::new();
        f.start_and_wait(ServiceConfig::default());
        assert_eq!(f.effects.created_count(), 0);

        f.dumps.set_dump(single_session());
        f.notify_tx
            .send(HostNotification::PlaybackConfigChanged)
            .unwrap();

        assert!(wait_until(TIMEOUT, || f.effects.instance(1).is_some()));
    }

    #[test]
    fn test_notifications_ignored_while_idle() {
        let f = Fixture::new();
        f.dumps.set_dump(single_session());

        f.notify_tx
            .send(HostNotification::PlaybackConfigChanged)
            .unwrap();
        f.barrier();

        assert_eq!(f.dumps.calls(), 0);
    }

    #[test]
    fn test_shutdown_exits_run_loop() {
        let mut f = Fixture::new();
        f.start_and_wait(ServiceConfig::default());

        f.send(ServiceCommand::Shutdown);

        assert!(f.wait_event(|e| matches!(e, ServiceEvent::Shutdown)));
        f.handle.take().unwrap().join().unwrap();
        assert!(f.state.read().is_idle());
        assert_eq!(f.engine().lock().freed, 1);
    }
}
