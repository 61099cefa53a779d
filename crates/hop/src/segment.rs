//! Shared IPC segment (C3), §4.3.
//!
//! Creates or attaches a named, fixed-size POSIX shared-memory region
//! holding a header followed by the ring buffer and its worker slots, via
//! [`crate::shm::MappedRegion`]. Only the Unix `shm_open`/`mmap` path is
//! implemented; a `CreateFileMapping` equivalent for Windows is out of
//! scope — see `DESIGN.md`.

use crate::clock::{self, ClockSource};
use crate::config::Config;
use crate::error::HopError;
use crate::ring::Ring;
use crate::shm::MappedRegion;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

pub const CORE_VERSION: f32 = 1.0;
const VERSION_TOLERANCE: f32 = 0.001;
pub const MAX_SEGMENT_NAME_LEN: usize = 30;

/// Fixed byte layout of the header, ahead of the ring region. Every slot
/// is 8-byte aligned and addressed through `from_ptr`, the same approach
/// [`crate::ring::Ring`] uses for its control words — see that module's
/// docs for why a raw base pointer (rather than owned atomic fields) is
/// what lets the same header type serve both a freshly created segment
/// and one mapped from another process.
mod layout {
    pub const CLIENT_VERSION: usize = 0;
    pub const MAX_THREAD_NB: usize = 8;
    pub const REQUESTED_SIZE: usize = 16;
    pub const RING_CAPACITY_BYTES: usize = 24;
    pub const LAST_RESET_TIMESTAMP: usize = 32;
    pub const LAST_HEARTBEAT_TIMESTAMP: usize = 40;
    pub const STATE: usize = 48;
    pub const USING_STD_CHRONO_TIMESTAMPS: usize = 56;
    pub const ANCHOR_WALL_NANOS: usize = 64;
    pub const ANCHOR_CYCLES: usize = 72;
    pub const LEN: usize = 80;
}

/// Atomic bit-set/clear helpers over the segment's 32-bit state word, used
/// via CAS loops per §4.3 / §9 ("shared mutable state... CAS loops for
/// bit-set/bit-clear"). A lightweight handle over the state word's address
/// rather than its owner — cheap to construct on demand from
/// [`SegmentHeader::state`].
pub struct SharedState {
    ptr: *mut u32,
}

// SAFETY: see `SegmentHeader`'s impl below — same sharing discipline.
unsafe impl Send for SharedState {}
unsafe impl Sync for SharedState {}

impl SharedState {
    #[inline]
    fn atomic(&self) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.ptr) }
    }

    pub fn get(&self) -> u32 {
        self.atomic().load(Ordering::SeqCst)
    }

    pub fn set_bit(&self, mask: u32) {
        let mut cur = self.atomic().load(Ordering::SeqCst);
        loop {
            let new = cur | mask;
            match self.atomic().compare_exchange_weak(cur, new, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn clear_bit(&self, mask: u32) -> u32 {
        let mut cur = self.atomic().load(Ordering::SeqCst);
        loop {
            let new = cur & !mask;
            match self.atomic().compare_exchange_weak(cur, new, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return new,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn has(&self, mask: u32) -> bool {
        self.get() & mask != 0
    }
}

pub const CONNECTED_PRODUCER: u32 = 1 << 0;
pub const CONNECTED_CONSUMER: u32 = 1 << 1;
pub const LISTENING_CONSUMER: u32 = 1 << 2;

/// A view over the segment header (§4.3 layout) at some base address —
/// either inside a process-owned allocation or a shared mapping. See the
/// `layout` submodule for the field offsets this addresses.
pub struct SegmentHeader {
    base: *mut u8,
}

// SAFETY: every field is accessed exclusively through atomic ops over a
// raw pointer into memory that outlives this handle (guaranteed by
// `Segment`, which owns the allocation/mapping `base` points into).
unsafe impl Send for SegmentHeader {}
unsafe impl Sync for SegmentHeader {}

impl SegmentHeader {
    /// # Safety
    /// `base` must be valid for reads and writes for at least
    /// `layout::LEN` bytes, 8-byte aligned, and remain valid for as long
    /// as the returned header is used.
    unsafe fn at(base: *mut u8) -> Self {
        Self { base }
    }

    #[inline]
    fn u64_at(&self, off: usize) -> &AtomicU64 {
        unsafe { AtomicU64::from_ptr(self.base.add(off).cast()) }
    }

    #[inline]
    fn u32_at(&self, off: usize) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.base.add(off).cast()) }
    }

    #[inline]
    fn u8_at(&self, off: usize) -> &AtomicU8 {
        unsafe { AtomicU8::from_ptr(self.base.add(off).cast()) }
    }

    /// Writes the initial state for a segment a producer is creating.
    /// Must not be called when attaching to an existing segment.
    fn init_fresh(&self, config: &Config, clock: ClockSource, ring_capacity_bytes: u64) {
        self.u64_at(layout::CLIENT_VERSION).store(CORE_VERSION.to_bits() as u64, Ordering::SeqCst);
        self.u32_at(layout::MAX_THREAD_NB).store(config.max_threads, Ordering::SeqCst);
        self.u64_at(layout::REQUESTED_SIZE).store(config.requested_payload, Ordering::SeqCst);
        self.u64_at(layout::RING_CAPACITY_BYTES).store(ring_capacity_bytes, Ordering::SeqCst);
        self.u64_at(layout::LAST_RESET_TIMESTAMP).store(0, Ordering::SeqCst);
        self.u64_at(layout::LAST_HEARTBEAT_TIMESTAMP).store(0, Ordering::SeqCst);
        self.u32_at(layout::STATE).store(0, Ordering::SeqCst);
        self.u8_at(layout::USING_STD_CHRONO_TIMESTAMPS).store(clock.uses_std_chrono() as u8, Ordering::SeqCst);
        let anchor = clock::wall_clock_anchor(clock);
        self.u64_at(layout::ANCHOR_WALL_NANOS).store(anchor.wall_nanos, Ordering::SeqCst);
        self.u64_at(layout::ANCHOR_CYCLES).store(anchor.cycles, Ordering::SeqCst);
    }

    pub fn state(&self) -> SharedState {
        SharedState { ptr: unsafe { self.base.add(layout::STATE).cast() } }
    }

    pub fn client_version(&self) -> f32 {
        f32::from_bits(self.u64_at(layout::CLIENT_VERSION).load(Ordering::SeqCst) as u32)
    }

    pub fn max_thread_nb(&self) -> u32 {
        self.u32_at(layout::MAX_THREAD_NB).load(Ordering::SeqCst)
    }

    pub fn ring_capacity_bytes(&self) -> u64 {
        self.u64_at(layout::RING_CAPACITY_BYTES).load(Ordering::SeqCst)
    }

    pub fn last_reset_timestamp(&self) -> u64 {
        self.u64_at(layout::LAST_RESET_TIMESTAMP).load(Ordering::SeqCst)
    }

    /// Consumer-side: instructs every producer to drop and re-emit its
    /// string table (§4.3 "Reset").
    pub fn request_reset(&self, at: u64) {
        self.u64_at(layout::LAST_RESET_TIMESTAMP).store(at, Ordering::SeqCst);
    }

    pub fn record_heartbeat(&self, at: u64) {
        self.u64_at(layout::LAST_HEARTBEAT_TIMESTAMP).store(at, Ordering::SeqCst);
    }

    pub fn last_heartbeat_timestamp(&self) -> u64 {
        self.u64_at(layout::LAST_HEARTBEAT_TIMESTAMP).load(Ordering::SeqCst)
    }

    /// §3 wall-clock↔cycle anchor, captured once on the producer's first
    /// connection — lets a consumer convert a `Timestamp`'s cycles back to
    /// wall-clock time.
    pub fn wall_clock_anchor(&self) -> clock::WallClockAnchor {
        clock::WallClockAnchor {
            wall_nanos: self.u64_at(layout::ANCHOR_WALL_NANOS).load(Ordering::SeqCst),
            cycles: self.u64_at(layout::ANCHOR_CYCLES).load(Ordering::SeqCst),
        }
    }
}

/// An attached or created shared segment, owning the mapping, header, and
/// ring. `Segment` is the producer- or consumer-side handle; both sides
/// use the same type with different entry points ([`Segment::create`] vs
/// [`Segment::attach`]).
pub struct Segment {
    mapping: MappedRegion,
    header: SegmentHeader,
    ring: Ring,
    name: String,
}

fn segment_name(pid: u32) -> Result<String, HopError> {
    let name = format!("/hop_{pid}");
    if name.len() > MAX_SEGMENT_NAME_LEN {
        return Err(HopError::UnknownConnectionError);
    }
    Ok(name)
}

impl Segment {
    /// Producer side: create the named region for the current process,
    /// sized from `config`, and mark it connected.
    pub fn create(config: &Config, pid: u32) -> Result<Self, HopError> {
        let name = segment_name(pid)?;
        let clock = ClockSource::detect();
        let capacity = config.ring_capacity();
        let max_workers = config.max_threads as usize;
        let total_len = layout::LEN + Ring::shared_len(capacity, max_workers);

        let mut mapping = MappedRegion::create(&name, total_len)?;
        let base = mapping.as_mut_ptr();
        // SAFETY: `mapping` was just sized to hold exactly `total_len`
        // bytes and outlives `header`/`ring` as a sibling field of `Self`.
        let header = unsafe { SegmentHeader::at(base) };
        header.init_fresh(config, clock, capacity as u64);
        let ring = unsafe { Ring::from_shared(base.add(layout::LEN), capacity, max_workers, true) };

        let segment = Self { mapping, header, ring, name };
        segment.header.state().set_bit(CONNECTED_PRODUCER);
        Ok(segment)
    }

    /// Consumer side: attach to the segment a producer for `pid` has
    /// already created. Fails with `NotConnected` if the producer bit is
    /// not set, and with `InvalidVersion` if the producer's version is
    /// incompatible.
    pub fn attach(pid: u32) -> Result<Self, HopError> {
        let name = segment_name(pid)?;
        let mut mapping = MappedRegion::attach(&name)?;
        if mapping.len() < layout::LEN {
            return Err(HopError::UnknownConnectionError);
        }
        let base = mapping.as_mut_ptr();
        // SAFETY: `mapping` was just attached and its length was checked
        // above to cover at least the header.
        let header = unsafe { SegmentHeader::at(base) };

        if !header.state().has(CONNECTED_PRODUCER) {
            return Err(HopError::NotConnected);
        }
        let found = header.client_version();
        if (found - CORE_VERSION).abs() > VERSION_TOLERANCE {
            return Err(HopError::InvalidVersion { expected: CORE_VERSION, found });
        }

        let capacity = header.ring_capacity_bytes() as usize;
        let max_workers = header.max_thread_nb() as usize;
        if mapping.len() < layout::LEN + Ring::shared_len(capacity, max_workers) {
            return Err(HopError::UnknownConnectionError);
        }
        // SAFETY: `fresh = false` — the producer already initialized this
        // region; attaching must only read its live state.
        let ring = unsafe { Ring::from_shared(base.add(layout::LEN), capacity, max_workers, false) };

        if header.state().has(CONNECTED_CONSUMER) {
            log::warn!("segment {name} already has a connected consumer; forcing LISTENING_CONSUMER clear");
            header.state().clear_bit(LISTENING_CONSUMER);
        }
        header.state().set_bit(CONNECTED_CONSUMER);

        Ok(Self { mapping, header, ring, name })
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mapped_len(&self) -> usize {
        self.mapping.len()
    }

    /// §4.3 "Teardown": clear the caller's connection bit; when both bits
    /// are clear the segment is unlinked.
    pub fn disconnect_producer(&self) {
        let remaining = self.header.state().clear_bit(CONNECTED_PRODUCER);
        if remaining & (CONNECTED_PRODUCER | CONNECTED_CONSUMER) == 0 {
            MappedRegion::unlink(&self.name);
        }
    }

    pub fn disconnect_consumer(&self) {
        let remaining = self.header.state().clear_bit(CONNECTED_CONSUMER | LISTENING_CONSUMER);
        if remaining & (CONNECTED_PRODUCER | CONNECTED_CONSUMER) == 0 {
            MappedRegion::unlink(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn unique_pid(tag: u32) -> u32 {
        // `shm_open` names are process-wide; give each test its own name
        // by mixing in the actual pid so repeated `cargo test` runs or
        // parallel test binaries never collide on a stale leftover object.
        std::process::id().wrapping_mul(1000).wrapping_add(tag)
    }

    #[test]
    fn segment_name_uses_pid() {
        assert_eq!(segment_name(1234).unwrap(), "/hop_1234");
    }

    #[test]
    fn create_sets_producer_bit() {
        let cfg = Config::new(12, 4, 0);
        let seg = Segment::create(&cfg, unique_pid(1)).unwrap();
        assert!(seg.header().state().has(CONNECTED_PRODUCER));
        assert!(!seg.header().state().has(CONNECTED_CONSUMER));
        seg.disconnect_producer();
    }

    #[test]
    fn attach_fails_without_producer() {
        let cfg = Config::new(12, 4, 0);
        let pid = unique_pid(2);
        let seg = Segment::create(&cfg, pid).unwrap();
        seg.header.state().clear_bit(CONNECTED_PRODUCER);
        assert!(matches!(Segment::attach(pid), Err(HopError::NotConnected)));
        MappedRegion::unlink(&segment_name(pid).unwrap());
    }

    #[test]
    fn attach_fails_for_unknown_pid() {
        assert!(matches!(Segment::attach(u32::MAX - 1), Err(HopError::NotConnected)));
    }

    #[test]
    fn attach_checks_version() {
        let cfg = Config::new(12, 4, 0);
        let pid = unique_pid(3);
        let seg = Segment::create(&cfg, pid).unwrap();
        seg.header.u64_at(layout::CLIENT_VERSION).store((CORE_VERSION + 10.0).to_bits() as u64, Ordering::SeqCst);
        assert!(matches!(Segment::attach(pid), Err(HopError::InvalidVersion { .. })));
        seg.disconnect_producer();
    }

    #[test]
    fn attach_succeeds_and_sees_producer_state() {
        let cfg = Config::new(12, 4, 0);
        let pid = unique_pid(4);
        let producer = Segment::create(&cfg, pid).unwrap();
        let consumer = Segment::attach(pid).unwrap();
        assert!(consumer.header().state().has(CONNECTED_CONSUMER));
        assert!(producer.header().state().has(CONNECTED_CONSUMER));

        let worker = producer.ring().register_worker();
        let mut r = producer.ring().acquire(worker, 4).unwrap();
        r.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);
        r.commit();
        assert_eq!(consumer.ring().readable(), 4);
        assert_eq!(consumer.ring().peek(4), &[1, 2, 3, 4]);

        producer.disconnect_producer();
        consumer.disconnect_consumer();
    }
}
