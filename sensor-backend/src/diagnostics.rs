//! Pipeline statistics counters.
//!
//! Components hold an explicit [`Diagnostics`] handle (a cheap clone of a
//! shared atomic counter block); the process-wide accessor exists only as a
//! convenience for code with no handle in reach. Counters are how drop rates
//! surface for diagnosis — the pipeline itself keeps running through any
//! recoverable error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub packets_received: AtomicU64,
    pub packets_rejected: AtomicU64,
    pub packets_queue_dropped: AtomicU64,
    pub points_decoded: AtomicU64,
    pub frames_assembled: AtomicU64,
    pub frames_published: AtomicU64,
    pub frames_dropped_inbound: AtomicU64,
    pub subscriber_drops: AtomicU64,
    pub background_frames: AtomicU64,
    pub recorder_errors: AtomicU64,
}

impl PipelineStats {
    pub fn snapshot_line(&self) -> String {
        format!(
            "rx={} rejected={} points={} frames={} published={} dropped={} sub_drops={}",
            self.packets_received.load(Ordering::Relaxed),
            self.packets_rejected.load(Ordering::Relaxed),
            self.points_decoded.load(Ordering::Relaxed),
            self.frames_assembled.load(Ordering::Relaxed),
            self.frames_published.load(Ordering::Relaxed),
            self.frames_dropped_inbound.load(Ordering::Relaxed),
            self.subscriber_drops.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    stats: Arc<PipelineStats>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn count(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Process-wide convenience handle.
pub fn global() -> &'static Diagnostics {
    static GLOBAL: OnceLock<Diagnostics> = OnceLock::new();
    GLOBAL.get_or_init(Diagnostics::new)
}
