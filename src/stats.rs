use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pipeline-wide counters, shared across all actors and surfaced through the
/// control API.
#[derive(Debug, Default)]
pub struct PipelineStats {
    measurements_pushed: AtomicU64,
    batches_pushed: AtomicU64,
    pushes_dropped: AtomicU64,
    fetch_failures: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub measurements_pushed: u64,
    pub batches_pushed: u64,
    pub pushes_dropped: u64,
    pub fetch_failures: u64,
    pub reconnects: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_push(&self, measurements: u64) {
        self.batches_pushed.fetch_add(1, Ordering::Relaxed);
        self.measurements_pushed
            .fetch_add(measurements, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, measurements: u64) {
        self.pushes_dropped.fetch_add(measurements, Ordering::Relaxed);
    }

    pub fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            measurements_pushed: self.measurements_pushed.load(Ordering::Relaxed),
            batches_pushed: self.batches_pushed.load(Ordering::Relaxed),
            pushes_dropped: self.pushes_dropped.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}
