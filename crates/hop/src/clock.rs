//! Timestamps and the dynamic-string flag they carry.
//!
//! §9 "Low-bit flag on timestamps": bit 0 of a trace's `start` marks that
//! the trace's `fn_id` is a dynamic (content-hashed) string rather than a
//! static (address-as-identity) one. This crate packs the flag into
//! `start` rather than carrying a parallel `flags` column, matching the
//! wire format in §6. Every arithmetic operation on a `Timestamp` taken
//! from the wire or from a trace's `start` field must go through
//! [`cycles`] first.

use std::sync::atomic::{AtomicU64, Ordering};

/// A 64-bit cycle (or nanosecond, see [`ClockSource`]) counter value.
/// The low bit may be a dynamic-string flag depending on where the value
/// came from — see module docs.
pub type Timestamp = u64;

pub const DYNAMIC_STRING_FLAG: u64 = 1;

/// Strip the dynamic-string flag before doing arithmetic on a `start`.
#[inline]
pub fn cycles(ts: Timestamp) -> u64 {
    ts & !DYNAMIC_STRING_FLAG
}

#[inline]
pub fn is_dynamic(start: Timestamp) -> bool {
    start & DYNAMIC_STRING_FLAG != 0
}

#[inline]
pub fn with_dynamic_flag(start: Timestamp) -> Timestamp {
    cycles(start) | DYNAMIC_STRING_FLAG
}

/// §9 "cycle counter portability": hardware without a constant/invariant
/// cycle counter falls back to a monotonic nanosecond clock. Recorded in
/// the segment header as `usingStdChronoTimestamps` so the consumer knows
/// which domain it is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// A hardware cycle counter (e.g. `rdtscp` on x86_64) assumed constant
    /// and invariant across cores.
    CycleCounter,
    /// `std::time::Instant`-equivalent monotonic nanosecond clock.
    MonotonicNanos,
}

impl ClockSource {
    /// Picks the best available source for the current target. x86_64
    /// platforms are assumed to expose an invariant TSC; everything else
    /// falls back to the portable monotonic clock. This is a per-process
    /// choice, made once, recorded in the shared segment header, and never
    /// revisited — §9 requires only that all producers in a segment agree.
    pub fn detect() -> Self {
        if cfg!(target_arch = "x86_64") {
            ClockSource::CycleCounter
        } else {
            ClockSource::MonotonicNanos
        }
    }

    pub fn uses_std_chrono(self) -> bool {
        matches!(self, ClockSource::MonotonicNanos)
    }
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn read_cycle_counter() -> u64 {
    // SAFETY: rdtsc is available on all x86_64 CPUs; we do not rely on
    // `rdtscp`'s core-serialization properties for correctness, only for
    // rough ordering.
    unsafe { core::arch::x86_64::_rdtsc() }
}

fn monotonic_nanos() -> u64 {
    use std::time::Instant;
    thread_local! {
        static EPOCH: Instant = Instant::now();
    }
    EPOCH.with(Instant::elapsed).as_nanos() as u64
}

/// Reads the current time from the given source, masking off bit 0 so the
/// caller may freely OR in the dynamic-string flag afterwards.
#[inline]
pub fn now(source: ClockSource) -> Timestamp {
    let raw = match source {
        #[cfg(target_arch = "x86_64")]
        ClockSource::CycleCounter => read_cycle_counter(),
        #[cfg(not(target_arch = "x86_64"))]
        ClockSource::CycleCounter => monotonic_nanos(),
        ClockSource::MonotonicNanos => monotonic_nanos(),
    };
    cycles(raw)
}

/// Wall-clock nanoseconds since `UNIX_EPOCH` paired with the `now(source)`
/// value captured at the same instant. §3 requires this anchor so a
/// consumer attached to a different process can convert a `Timestamp`'s
/// cycles back to wall-clock time: `wall_nanos + (cycles(ts) - cycles)`.
/// For [`ClockSource::CycleCounter`] this conversion is only as accurate as
/// the TSC frequency the consumer assumes; no calibration is performed
/// here, matching §9's silence on cross-core TSC skew.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallClockAnchor {
    pub wall_nanos: u64,
    pub cycles: u64,
}

static ANCHOR_WALL_NANOS: AtomicU64 = AtomicU64::new(0);
static ANCHOR_CYCLES: AtomicU64 = AtomicU64::new(0);

/// Captures the anchor once per process, on the first connection; later
/// calls (from other threads, or a later segment create/attach in the same
/// process) observe the same pinned pair.
pub fn wall_clock_anchor(source: ClockSource) -> WallClockAnchor {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let wall = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        ANCHOR_WALL_NANOS.store(wall, Ordering::Relaxed);
        ANCHOR_CYCLES.store(cycles(now(source)), Ordering::Relaxed);
    });
    WallClockAnchor {
        wall_nanos: ANCHOR_WALL_NANOS.load(Ordering::Relaxed),
        cycles: ANCHOR_CYCLES.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_roundtrips() {
        let t = 0xDEAD_BEEF_0000_0000u64;
        let flagged = with_dynamic_flag(t);
        assert!(is_dynamic(flagged));
        assert_eq!(cycles(flagged), t);
    }

    #[test]
    fn unflagged_is_not_dynamic() {
        assert!(!is_dynamic(1234));
        assert_eq!(cycles(1234), 1234);
    }

    #[test]
    fn wall_clock_anchor_is_pinned_after_first_call() {
        let source = ClockSource::detect();
        let a = wall_clock_anchor(source);
        let b = wall_clock_anchor(source);
        assert_eq!(a, b);
        assert!(a.wall_nanos > 0);
    }

    #[test]
    fn now_is_monotonic_per_thread() {
        let source = ClockSource::detect();
        let a = now(source);
        let b = now(source);
        assert!(b >= a);
    }
}
