//! Pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use loopfx_ipc::PipelineStats;

/// Counts what the capture loop did.
#[derive(Default)]
pub struct PipelineMetrics {
    start_time: RwLock<Option<Instant>>,
    buffers_processed: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    recreates: AtomicU64,
    idle_suspensions: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        *self.start_time.write() = Some(Instant::now());
    }

    pub fn stop(&self) {
        *self.start_time.write() = None;
    }

    pub fn record_buffer(&self) {
        self.buffers_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recreate(&self) {
        self.recreates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle_suspension(&self) {
        self.idle_suspensions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStats {
        let uptime_seconds = self
            .start_time
            .read()
            .map(|s| s.elapsed().as_secs())
            .unwrap_or(0);

        PipelineStats {
            buffers_processed: self.buffers_processed.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            recreates: self.recreates.load(Ordering::Relaxed),
            idle_suspensions: self.idle_suspensions.load(Ordering::Relaxed),
            uptime_seconds,
        }
    }
}
