/// Configuration for a shared tracing segment.
///
/// Mirrors the ring-buffer `Config` pattern: plain data, `const fn`
/// constructors with compile-time-checkable invariants, and named presets
/// rather than a builder. Command-line and config-file parsing are out of
/// scope; callers construct this directly.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Ring buffer capacity as a power of two (payload bytes, not counting
    /// the header or worker slots).
    pub ring_bits: u8,
    /// Maximum number of producer threads the segment reserves worker slots
    /// for (`maxThreadNb` in §4.3).
    pub max_threads: u32,
    /// Extra payload bytes requested beyond the header + ring.
    pub requested_payload: u64,
    /// Whether the producer bothers incrementing `Metrics` counters.
    pub enable_metrics: bool,
    /// Minimum duration, in cycles, for a lock-wait event to be kept
    /// (§4.4 `lock_acquired`).
    pub min_lock_wait_cycles: u64,
    /// Minimum number of cycles between two heartbeat writes (§4.3).
    pub heartbeat_interval_cycles: u64,
}

impl Config {
    /// Builds a config, panicking at construction time on out-of-range
    /// values so misconfiguration is caught immediately rather than as a
    /// confusing allocation failure later.
    pub const fn new(ring_bits: u8, max_threads: u32, requested_payload: u64) -> Self {
        assert!(ring_bits >= 10 && ring_bits <= 30, "ring_bits out of range");
        assert!(max_threads > 0, "max_threads must be nonzero");
        Self {
            ring_bits,
            max_threads,
            requested_payload,
            enable_metrics: true,
            min_lock_wait_cycles: 1_000,
            heartbeat_interval_cycles: 100_000_000,
        }
    }

    pub const fn with_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = enable;
        self
    }

    pub const fn with_min_lock_wait_cycles(mut self, cycles: u64) -> Self {
        self.min_lock_wait_cycles = cycles;
        self
    }

    pub const fn ring_capacity(&self) -> usize {
        1usize << self.ring_bits
    }
}

/// Small segment, few threads, favors low per-trace overhead over headroom.
pub const LOW_LATENCY_CONFIG: Config = Config::new(16, 8, 0);

/// Large ring, many threads, for workloads that burst far ahead of the
/// consumer's drain rate.
pub const HIGH_THROUGHPUT_CONFIG: Config = Config::new(24, 64, 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_capacity_matches_bits() {
        let cfg = Config::new(12, 4, 0);
        assert_eq!(cfg.ring_capacity(), 4096);
    }

    #[test]
    fn presets_are_internally_consistent() {
        assert_eq!(LOW_LATENCY_CONFIG.ring_capacity(), 1 << 16);
        assert_eq!(HIGH_THROUGHPUT_CONFIG.ring_capacity(), 1 << 24);
    }

    #[test]
    #[should_panic(expected = "ring_bits out of range")]
    fn rejects_absurd_ring_bits() {
        let _ = Config::new(63, 1, 0);
    }
}
