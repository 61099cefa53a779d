use std::sync::atomic::{AtomicU64, Ordering};

/// Per-segment counters. All loads/stores use `Ordering::Relaxed`: these are
/// purely statistical counters with no control-flow dependency and no
/// happens-before relationship to guard, unlike the ring buffer's `next`/
/// `written` offsets or the segment's reset/heartbeat timestamps.
#[derive(Debug, Default)]
pub struct Metrics {
    pub traces_emitted: AtomicU64,
    pub flushes: AtomicU64,
    pub ring_full_events: AtomicU64,
    pub heartbeats_sent: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces_emitted(&self) -> u64 {
        self.traces_emitted.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn ring_full_events(&self) -> u64 {
        self.ring_full_events.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn record_flush(&self, trace_count: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.traces_emitted.fetch_add(trace_count, Ordering::Relaxed);
    }

    pub(crate) fn record_ring_full(&self) {
        self.ring_full_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }
}
