//! The capture → DSP → render loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use loopfx_dsp::EngineFacade;
use loopfx_ipc::{AudioEncoding, PipelineStats};

use crate::device::{
    AudioHost, CaptureAuthorization, CaptureConfig, CaptureDevice, DeviceRelease,
    ExclusionProvider, RenderDevice, StreamFormat,
};
use crate::error::AudioError;
use crate::metrics::PipelineMetrics;
use crate::AudioResult;

/// How long the loop parks while suspended on idle.
pub const IDLE_PARK_INTERVAL: Duration = Duration::from_millis(50);

/// How long `stop` waits for the worker before detaching it.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Why the worker thread exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineExit {
    /// `stop` was called.
    Disposed,
    /// The capture authorization was withdrawn.
    AuthorizationRevoked,
    /// A device could not be built or started.
    Fatal(String),
}

/// Collaborators of a pipeline.
#[derive(Clone)]
pub struct PipelineContext {
    pub host: Arc<dyn AudioHost>,
    pub facade: Arc<EngineFacade>,
    pub exclusions: Arc<dyn ExclusionProvider>,
    pub authorization: CaptureAuthorization,
    pub format: StreamFormat,
}

struct Shared {
    disposing: AtomicBool,
    recreate_requested: AtomicBool,
    revoked: AtomicBool,
    idle: AtomicBool,
    suspend_on_idle: AtomicBool,
    metrics: PipelineMetrics,
    /// Release handles of the devices the worker currently owns.
    capture_release: Mutex<Option<DeviceRelease>>,
    render_release: Mutex<Option<DeviceRelease>>,
}

impl Shared {
    /// Release whatever devices are registered. Returns how many were freed here.
    fn release_devices(&self) -> usize {
        let capture = self.capture_release.lock().take();
        let render = self.render_release.lock().take();
        [capture, render]
            .into_iter()
            .flatten()
            .filter(|handle| handle.release())
            .count()
    }
}

/// Owns the capture/render pair and the worker thread that moves audio
/// between them.
pub struct CapturePipeline {
    shared: Arc<Shared>,
    format: StreamFormat,
    worker: Mutex<Option<JoinHandle<()>>>,
    done_rx: Receiver<()>,
}

impl CapturePipeline {
    /// Build both devices and start the worker.
    ///
    /// Device construction happens on the calling thread, so a failure is
    /// returned here and no worker is spawned. The worker reports how it
    /// ended on `exit_tx`.
    #[instrument(name = "pipeline_start", skip_all, fields(encoding = ctx.format.encoding.name()))]
    pub fn start(
        ctx: PipelineContext,
        suspend_on_idle: bool,
        exit_tx: Sender<PipelineExit>,
    ) -> AudioResult<Self> {
        if !ctx.authorization.is_valid() {
            return Err(AudioError::AuthorizationRevoked);
        }

        let capture = build_capture(&ctx)?;
        let render = match ctx
            .host
            .build_render(&ctx.format, ctx.format.render_buffer_bytes())
        {
            Ok(render) => render,
            Err(e) => {
                capture.release_handle().release();
                return Err(e);
            }
        };

        let shared = Arc::new(Shared {
            disposing: AtomicBool::new(false),
            recreate_requested: AtomicBool::new(false),
            revoked: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            suspend_on_idle: AtomicBool::new(suspend_on_idle),
            metrics: PipelineMetrics::new(),
            capture_release: Mutex::new(Some(capture.release_handle())),
            render_release: Mutex::new(Some(render.release_handle())),
        });

        let format = ctx.format;
        let worker = Worker {
            buffers: Buffers::new(&format),
            capture: Some(capture),
            render,
            shared: Arc::clone(&shared),
            ctx,
        };
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        shared.metrics.start();
        let handle = thread::Builder::new()
            .name("loopfx-capture".into())
            .spawn(move || {
                let exit = worker.run();
                let _ = done_tx.send(());
                if exit_tx.send(exit).is_err() {
                    debug!("Pipeline owner gone before exit was reported");
                }
            })
            .map_err(AudioError::WorkerSpawn)?;

        info!(
            sample_rate = format.sample_rate,
            buffer_samples = format.buffer_samples,
            "Capture pipeline started"
        );

        Ok(Self {
            shared,
            format,
            worker: Mutex::new(Some(handle)),
            done_rx,
        })
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Whether the worker is still looping.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Rebuild the capture device on the next iteration. Safe from any thread.
    pub fn request_recreate(&self) {
        debug!("Capture recreate requested");
        self.shared.recreate_requested.store(true, Ordering::SeqCst);
    }

    /// No sessions are being processed.
    pub fn set_idle(&self, idle: bool) {
        self.shared.idle.store(idle, Ordering::SeqCst);
        if !idle {
            self.unpark();
        }
    }

    pub fn set_suspend_on_idle(&self, suspend: bool) {
        self.shared.suspend_on_idle.store(suspend, Ordering::SeqCst);
        if !suspend {
            self.unpark();
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.metrics.snapshot()
    }

    /// Stop the worker and wait up to [`SHUTDOWN_TIMEOUT`] for it to release
    /// the devices. A worker that does not answer in time is detached and its
    /// devices are released from here.
    #[instrument(name = "pipeline_stop", skip(self))]
    pub fn stop(&self) {
        if self.shared.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping capture pipeline");

        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        handle.thread().unpark();

        match self.done_rx.recv_timeout(SHUTDOWN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                info!("Capture pipeline stopped");
            }
            Err(RecvTimeoutError::Timeout) => {
                let released = self.shared.release_devices();
                warn!(released, "Capture thread did not stop in time, detaching");
            }
        }
        self.shared.metrics.stop();
    }

    fn unpark(&self) {
        if let Some(handle) = self.worker.lock().as_ref() {
            handle.thread().unpark();
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_capture(ctx: &PipelineContext) -> AudioResult<Box<dyn CaptureDevice>> {
    if !ctx.authorization.is_valid() {
        return Err(AudioError::AuthorizationRevoked);
    }
    let config = CaptureConfig {
        format: ctx.format,
        excluded_uids: ctx.exclusions.excluded_uids(),
        authorization: ctx.authorization.clone(),
    };
    debug!(excluded = ?config.excluded_uids, "Building capture device");
    ctx.host.build_capture(&config)
}

enum Buffers {
    Float { input: Vec<f32>, output: Vec<f32> },
    Short { input: Vec<i16>, output: Vec<i16> },
}

impl Buffers {
    fn new(format: &StreamFormat) -> Self {
        let len = format.buffer_samples;
        match format.encoding {
            AudioEncoding::PcmFloat => Self::Float {
                input: vec![0.0; len],
                output: vec![0.0; len],
            },
            AudioEncoding::PcmShort => Self::Short {
                input: vec![0; len],
                output: vec![0; len],
            },
        }
    }
}

struct Worker {
    ctx: PipelineContext,
    shared: Arc<Shared>,
    capture: Option<Box<dyn CaptureDevice>>,
    render: Box<dyn RenderDevice>,
    buffers: Buffers,
}

impl Worker {
    fn run(mut self) -> PipelineExit {
        // Revocation interrupts an idle park right away.
        {
            let shared = Arc::downgrade(&self.shared);
            let thread = thread::current();
            self.ctx.authorization.on_revoked(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.revoked.store(true, Ordering::SeqCst);
                }
                thread.unpark();
            });
        }

        debug!("Capture loop starting");
        let mut last_stats = Instant::now();
        let mut suspended = false;

        let exit = loop {
            if self.shared.disposing.load(Ordering::SeqCst) {
                break PipelineExit::Disposed;
            }
            if self.shared.revoked.load(Ordering::SeqCst) {
                break PipelineExit::AuthorizationRevoked;
            }

            if self.shared.recreate_requested.swap(false, Ordering::SeqCst) {
                if let Err(e) = self.rebuild_capture() {
                    break match e {
                        AudioError::AuthorizationRevoked => PipelineExit::AuthorizationRevoked,
                        e => {
                            error!("Capture rebuild failed: {}", e);
                            PipelineExit::Fatal(e.to_string())
                        }
                    };
                }
            }

            if self.shared.idle.load(Ordering::SeqCst)
                && self.shared.suspend_on_idle.load(Ordering::SeqCst)
            {
                if !suspended {
                    debug!("No active sessions, suspending devices");
                    self.stop_devices();
                    self.shared.metrics.record_idle_suspension();
                    suspended = true;
                }
                thread::park_timeout(IDLE_PARK_INTERVAL);
                continue;
            }
            suspended = false;

            if let Err(e) = self.ensure_running() {
                error!("Failed to start devices: {}", e);
                break PipelineExit::Fatal(e.to_string());
            }

            self.process_buffer();

            if last_stats.elapsed() >= STATS_INTERVAL {
                let stats = self.shared.metrics.snapshot();
                info!(
                    "Pipeline stats: buffers={}, read_errors={}, write_errors={}, recreates={}, uptime={}s",
                    stats.buffers_processed,
                    stats.read_errors,
                    stats.write_errors,
                    stats.recreates,
                    stats.uptime_seconds
                );
                last_stats = Instant::now();
            }
        };

        self.release_devices();
        info!(?exit, "Capture loop stopped");
        exit
    }

    #[instrument(name = "capture_rebuild", skip(self))]
    fn rebuild_capture(&mut self) -> AudioResult<()> {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
            capture.release_handle().release();
        }
        *self.shared.capture_release.lock() = None;
        let capture = build_capture(&self.ctx)?;
        *self.shared.capture_release.lock() = Some(capture.release_handle());
        self.capture = Some(capture);
        self.shared.metrics.record_recreate();
        info!("Capture device rebuilt");
        Ok(())
    }

    fn ensure_running(&mut self) -> AudioResult<()> {
        if let Some(capture) = self.capture.as_mut() {
            if !capture.is_running() {
                capture.start()?;
            }
        }
        if !self.render.is_running() {
            self.render.start()?;
        }
        Ok(())
    }

    fn process_buffer(&mut self) {
        let Some(capture) = self.capture.as_mut() else {
            return;
        };
        let facade = &self.ctx.facade;

        let result = match &mut self.buffers {
            Buffers::Float { input, output } => capture.read_f32(input).and_then(|n| {
                let n = n.min(input.len());
                facade.process_f32(&input[..n], &mut output[..n]);
                self.render.write_f32(&output[..n])
            }),
            Buffers::Short { input, output } => capture.read_i16(input).and_then(|n| {
                let n = n.min(input.len());
                facade.process_i16(&input[..n], &mut output[..n]);
                self.render.write_i16(&output[..n])
            }),
        };

        match result {
            Ok(_) => self.shared.metrics.record_buffer(),
            Err(AudioError::AuthorizationRevoked) => {
                self.shared.revoked.store(true, Ordering::SeqCst);
            }
            Err(e @ AudioError::Write(_)) => {
                self.shared.metrics.record_write_error();
                trace!("{}", e);
            }
            Err(e) => {
                self.shared.metrics.record_read_error();
                trace!("{}", e);
            }
        }
    }

    fn stop_devices(&mut self) {
        if let Some(capture) = self.capture.as_mut() {
            capture.stop();
        }
        self.render.stop();
    }

    fn release_devices(&mut self) {
        self.stop_devices();
        self.shared.release_devices();
        self.capture = None;
    }
}

#[cfg(test)]
mod tests {
    use loopfx_dsp::testing::MockEngine;
    use loopfx_dsp::{LoggingCallbacks, MemoryPreferences};

    use super::*;
    use crate::testing::{wait_until, FixedExclusions, MockAudioHost, CAPTURED_I16};

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        host: MockAudioHost,
        exclusions: Arc<FixedExclusions>,
        authorization: CaptureAuthorization,
        exit_rx: Receiver<PipelineExit>,
        pipeline: CapturePipeline,
    }

    fn start(encoding: AudioEncoding, suspend_on_idle: bool) -> Fixture {
        let host = MockAudioHost::new();
        let exclusions = Arc::new(FixedExclusions::new(vec![10_001]));
        let authorization = CaptureAuthorization::new();
        let (engine, _) = MockEngine::new();
        let facade = Arc::new(EngineFacade::new(
            Box::new(engine),
            Arc::new(MemoryPreferences::new()),
            Arc::new(LoggingCallbacks),
        ));
        let ctx = PipelineContext {
            host: Arc::new(host.clone()),
            facade,
            exclusions: exclusions.clone(),
            authorization: authorization.clone(),
            format: StreamFormat::new(encoding, Some(48_000), 64),
        };
        let (exit_tx, exit_rx) = crossbeam_channel::unbounded();
        let pipeline = CapturePipeline::start(ctx, suspend_on_idle, exit_tx).unwrap();
        Fixture {
            host,
            exclusions,
            authorization,
            exit_rx,
            pipeline,
        }
    }

    #[test]
    fn test_float_audio_goes_through_engine() {
        let f = start(AudioEncoding::PcmFloat, false);

        assert!(wait_until(WAIT, || f.host.state().lock().written_samples >= 64));
        assert_eq!(f.host.state().lock().last_f32, Some(0.5));

        f.pipeline.stop();
        assert_eq!(f.exit_rx.recv_timeout(WAIT), Ok(PipelineExit::Disposed));
        let state = f.host.state().lock();
        assert_eq!(state.captures_released, 1);
        assert_eq!(state.renders_released, 1);
        assert!(!state.capture_running);
    }

    #[test]
    fn test_short_audio_goes_through_engine() {
        let f = start(AudioEncoding::PcmShort, false);

        assert!(wait_until(WAIT, || f.host.state().lock().last_i16.is_some()));
        assert_eq!(f.host.state().lock().last_i16, Some(CAPTURED_I16 / 2));
        assert_eq!(f.host.state().lock().render_builds, vec![128]);
    }

    #[test]
    fn test_recreate_uses_current_exclusions() {
        let f = start(AudioEncoding::PcmFloat, false);
        f.exclusions.set(vec![100, 10_001]);

        f.pipeline.request_recreate();

        assert!(wait_until(WAIT, || f.host.state().lock().capture_builds.len() == 2));
        assert_eq!(f.host.state().lock().capture_builds[1], vec![100, 10_001]);
        assert!(wait_until(WAIT, || f.pipeline.stats().recreates == 1));
        assert!(f.pipeline.is_running());
    }

    #[test]
    fn test_idle_suspends_devices() {
        let f = start(AudioEncoding::PcmFloat, true);
        assert!(wait_until(WAIT, || f.host.state().lock().capture_running));

        f.pipeline.set_idle(true);
        assert!(wait_until(WAIT, || {
            let state = f.host.state().lock();
            !state.capture_running && !state.render_running
        }));
        assert_eq!(f.pipeline.stats().idle_suspensions, 1);

        f.pipeline.set_idle(false);
        assert!(wait_until(WAIT, || f.host.state().lock().capture_running));
    }

    #[test]
    fn test_idle_without_suspend_keeps_running() {
        let f = start(AudioEncoding::PcmFloat, false);
        f.pipeline.set_idle(true);

        let before = f.host.state().lock().written_samples;
        assert!(wait_until(WAIT, || f.host.state().lock().written_samples > before));
        assert_eq!(f.pipeline.stats().idle_suspensions, 0);
    }

    #[test]
    fn test_revoked_authorization_stops_pipeline() {
        let f = start(AudioEncoding::PcmFloat, false);

        f.authorization.revoke();

        assert_eq!(
            f.exit_rx.recv_timeout(WAIT),
            Ok(PipelineExit::AuthorizationRevoked)
        );
        assert!(wait_until(WAIT, || !f.pipeline.is_running()));
        assert_eq!(f.host.state().lock().captures_released, 1);
    }

    #[test]
    fn test_failed_rebuild_is_fatal() {
        let f = start(AudioEncoding::PcmFloat, false);
        f.host.state().lock().fail_capture_builds = true;

        f.pipeline.request_recreate();

        assert!(matches!(
            f.exit_rx.recv_timeout(WAIT),
            Ok(PipelineExit::Fatal(_))
        ));
    }

    #[test]
    fn test_read_errors_are_counted_and_skipped() {
        let f = start(AudioEncoding::PcmFloat, false);
        f.host.state().lock().failing_reads = 3;

        assert!(wait_until(WAIT, || f.pipeline.stats().read_errors == 3));
        let processed = f.pipeline.stats().buffers_processed;
        assert!(wait_until(WAIT, || f.pipeline.stats().buffers_processed > processed));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let f = start(AudioEncoding::PcmFloat, false);

        f.pipeline.stop();
        f.pipeline.stop();

        assert!(!f.pipeline.is_running());
        assert_eq!(f.exit_rx.recv_timeout(WAIT), Ok(PipelineExit::Disposed));
        assert!(f.exit_rx.try_recv().is_err());
    }

    #[test]
    fn test_stop_releases_devices_of_blocked_worker() {
        let f = start(AudioEncoding::PcmFloat, false);
        assert!(wait_until(WAIT, || f.host.state().lock().written_samples > 0));
        f.host.state().lock().read_delay = Some(Duration::from_secs(2));
        // Let the worker enter the slow read.
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        f.pipeline.stop();

        assert!(started.elapsed() < Duration::from_millis(1500));
        let state = f.host.state().lock();
        assert_eq!(state.captures_released, 1);
        assert_eq!(state.renders_released, 1);
        drop(state);

        // The worker still exits once its read returns, without releasing again.
        assert_eq!(
            f.exit_rx.recv_timeout(Duration::from_secs(4)),
            Ok(PipelineExit::Disposed)
        );
        assert_eq!(f.host.state().lock().captures_released, 1);
        assert_eq!(f.host.state().lock().renders_released, 1);
    }

    #[test]
    fn test_build_failure_is_returned_without_worker() {
        let host = MockAudioHost::new();
        host.state().lock().fail_render_builds = true;
        let (engine, _) = MockEngine::new();
        let ctx = PipelineContext {
            host: Arc::new(host.clone()),
            facade: Arc::new(EngineFacade::new(
                Box::new(engine),
                Arc::new(MemoryPreferences::new()),
                Arc::new(LoggingCallbacks),
            )),
            exclusions: Arc::new(FixedExclusions::default()),
            authorization: CaptureAuthorization::new(),
            format: StreamFormat::new(AudioEncoding::PcmFloat, None, 64),
        };
        let (exit_tx, _exit_rx) = crossbeam_channel::unbounded();

        let result = CapturePipeline::start(ctx, false, exit_tx);

        assert!(matches!(
            result,
            Err(AudioError::DeviceConstruction { device: "render", .. })
        ));
        assert_eq!(host.state().lock().captures_released, 1);
    }
}
