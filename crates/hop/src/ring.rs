//! Multi-producer single-consumer ring buffer (C2), §4.2.
//!
//! Byte-granular, variable-length reservations over a fixed-capacity byte
//! region, in the style of the NetBSD `ringbuf(9)` acquire/produce/consume/
//! release protocol, expressed here with the atomics style (explicit
//! `Ordering`, documented rationale per operation, `Backoff`-driven CAS
//! retry) this workspace uses for its ring types.
//!
//! `next` packs a wrap-lock flag (top bit) and a wrap counter (next 31
//! bits) around a 32-bit byte offset. `written` and `end` are plain
//! offsets; only `next` needs the lock/counter because only `next` is
//! contended across producers racing to reserve space.
//!
//! The control words, per-worker `seen` slots and byte buffer all live in
//! one contiguous region addressed through [`RingLayout`]: either a
//! process-owned `Box<[u8]>` ([`Ring::new`]) or a byte range inside a
//! shared segment's mapping ([`Ring::from_shared`]). Either way, `Ring`
//! only ever holds a raw base pointer and computes `AtomicU64`/`AtomicU32`
//! views over it on demand via `from_ptr`, so the same code works whether
//! the bytes are process-local or mapped from another process.

use crate::backoff::Backoff;
use crate::error::HopError;
use crate::invariants::{debug_assert_monotonic, debug_assert_no_overlap, debug_assert_no_overtake};
use std::sync::atomic::{AtomicU64, Ordering};

const WRAP_LOCK_BIT: u64 = 1 << 63;
const WRAP_COUNTER_SHIFT: u32 = 32;
const OFFSET_MASK: u64 = (1u64 << 32) - 1;
const WRAP_COUNTER_MASK: u64 = !WRAP_LOCK_BIT & !OFFSET_MASK;

#[inline]
fn offset_of(v: u64) -> u64 {
    v & OFFSET_MASK
}

#[inline]
fn wrap_counter_of(v: u64) -> u64 {
    (v & WRAP_COUNTER_MASK) >> WRAP_COUNTER_SHIFT
}

#[inline]
fn pack(offset: u64, wrap: u64) -> u64 {
    (wrap << WRAP_COUNTER_SHIFT) | offset
}

#[inline]
fn is_locked(v: u64) -> bool {
    v & WRAP_LOCK_BIT != 0
}

/// Fixed byte layout of a ring's control region, ahead of its data bytes.
/// Every slot is 8-byte aligned so each can be addressed as a plain
/// `u64`-wide atomic regardless of the host's native word size.
struct RingLayout {
    next_off: usize,
    end_off: usize,
    written_off: usize,
    registered_off: usize,
    seen_off: usize,
    data_off: usize,
    total_len: usize,
}

impl RingLayout {
    fn new(capacity: usize, max_workers: usize) -> Self {
        let next_off = 0;
        let end_off = next_off + 8;
        let written_off = end_off + 8;
        let registered_off = written_off + 8;
        let seen_off = registered_off + 8;
        let data_off = seen_off + max_workers * 8;
        Self {
            next_off,
            end_off,
            written_off,
            registered_off,
            seen_off,
            data_off,
            total_len: data_off + capacity,
        }
    }
}

/// The ring buffer proper, sized at construction. `max_workers` bounds the
/// number of distinct producer threads that may register.
pub struct Ring {
    base: *mut u8,
    layout: RingLayout,
    capacity: u64,
    max_workers: usize,
    // Keeps a process-owned backing buffer alive for `Ring::new`; unused
    // (and empty) for rings backed by a shared mapping someone else owns.
    _owned: Option<Box<[u8]>>,
}

// SAFETY: all writers through `Ring` are required (by the acquire
// protocol) to touch disjoint byte ranges; the single consumer only reads
// ranges the producers have already published via `produce`/release of
// the wrap-lock. When `base` points into a shared mapping, the caller of
// `from_shared` is responsible for keeping that mapping alive at least as
// long as this `Ring`. See module docs.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Allocates a process-owned ring: for same-process producer/consumer
    /// wiring in tests and benches, or any use of this crate that doesn't
    /// need cross-process sharing.
    pub fn new(capacity: usize, max_workers: usize) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        assert!(capacity <= OFFSET_MASK as usize, "ring capacity exceeds 32-bit offset space");
        let layout = RingLayout::new(capacity, max_workers);
        let mut bytes = vec![0u8; layout.total_len].into_boxed_slice();
        let base = bytes.as_mut_ptr();
        let ring = Self { base, layout, capacity: capacity as u64, max_workers, _owned: Some(bytes) };
        ring.init_fresh();
        ring
    }

    /// Constructs a ring whose control words and data bytes live at `base`,
    /// which must address at least [`RingLayout::new`]'s `total_len` bytes
    /// for `(capacity, max_workers)`. Pass `fresh = true` only when `base`
    /// has just been carved out for a new segment (§4.3 `Segment::create`);
    /// a consumer attaching to an existing segment must pass `false` so it
    /// observes the producer's already-live state instead of zeroing it
    /// out from under it.
    ///
    /// # Safety
    /// `base` must be valid for reads and writes for `total_len` bytes, be
    /// 8-byte aligned, and remain valid for as long as the returned `Ring`
    /// is used — the caller (the owning [`crate::segment::Segment`]) keeps
    /// the backing allocation or mapping alive.
    pub unsafe fn from_shared(base: *mut u8, capacity: usize, max_workers: usize, fresh: bool) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        assert!(capacity <= OFFSET_MASK as usize, "ring capacity exceeds 32-bit offset space");
        let layout = RingLayout::new(capacity, max_workers);
        let ring = Self { base, layout, capacity: capacity as u64, max_workers, _owned: None };
        if fresh {
            ring.init_fresh();
        }
        ring
    }

    /// How many bytes a ring of this shape occupies, control words + data.
    pub fn shared_len(capacity: usize, max_workers: usize) -> usize {
        RingLayout::new(capacity, max_workers).total_len
    }

    fn init_fresh(&self) {
        self.next_atomic().store(0, Ordering::Relaxed);
        self.end_atomic().store(0, Ordering::Relaxed);
        self.written_atomic().store(0, Ordering::Relaxed);
        self.registered_atomic().store(0, Ordering::Relaxed);
        for i in 0..self.max_workers {
            self.seen_atomic(i).store(u64::MAX, Ordering::Relaxed);
        }
    }

    #[inline]
    fn next_atomic(&self) -> &AtomicU64 {
        unsafe { AtomicU64::from_ptr(self.base.add(self.layout.next_off).cast()) }
    }

    #[inline]
    fn end_atomic(&self) -> &AtomicU64 {
        unsafe { AtomicU64::from_ptr(self.base.add(self.layout.end_off).cast()) }
    }

    #[inline]
    fn written_atomic(&self) -> &AtomicU64 {
        unsafe { AtomicU64::from_ptr(self.base.add(self.layout.written_off).cast()) }
    }

    #[inline]
    fn registered_atomic(&self) -> &AtomicU64 {
        unsafe { AtomicU64::from_ptr(self.base.add(self.layout.registered_off).cast()) }
    }

    #[inline]
    fn seen_atomic(&self, worker: usize) -> &AtomicU64 {
        debug_assert!(worker < self.max_workers);
        unsafe { AtomicU64::from_ptr(self.base.add(self.layout.seen_off + worker * 8).cast()) }
    }

    #[inline]
    unsafe fn data_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.capacity as usize);
        std::slice::from_raw_parts_mut(self.base.add(self.layout.data_off + offset), len)
    }

    #[inline]
    unsafe fn data(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.capacity as usize);
        std::slice::from_raw_parts(self.base.add(self.layout.data_off + offset), len)
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Registers a new producer worker, returning its slot index. Panics
    /// if `max_workers` registrations have already happened — the caller
    /// (the shared segment) is responsible for sizing the ring from
    /// `Config::max_threads`.
    pub fn register_worker(&self) -> usize {
        let idx = self.registered_atomic().fetch_add(1, Ordering::Relaxed) as usize;
        assert!(idx < self.max_workers, "exceeded max registered producer threads");
        idx
    }

    /// §4.2 `acquire`. Reserves `len` bytes for `worker`, retrying the CAS
    /// loop with [`Backoff`] until it either succeeds or the reservation
    /// would overtake the consumer's `written` cursor.
    pub fn acquire(&self, worker: usize, len: usize) -> Result<Reservation<'_>, HopError> {
        if len == 0 {
            return Err(HopError::RingFull);
        }
        if len as u64 > self.capacity {
            return Err(HopError::MessageTooLarge { len, capacity: self.capacity as usize });
        }

        let mut backoff = Backoff::new();
        loop {
            let raw = self.next_atomic().load(Ordering::Acquire);
            if is_locked(raw) {
                backoff.snooze();
                continue;
            }
            let off = offset_of(raw);
            let wrap = wrap_counter_of(raw);

            // Tentative publish: the consumer must not treat this as a
            // hard blocking point until the CAS below actually commits.
            self.seen_atomic(worker).store(raw, Ordering::Relaxed);

            let written = self.written_atomic().load(Ordering::Acquire);
            let straight_target = off + len as u64;

            if straight_target <= self.capacity {
                if off < written && straight_target >= written {
                    self.seen_atomic(worker).store(u64::MAX, Ordering::Release);
                    return Err(HopError::RingFull);
                }
                debug_assert_no_overlap!(off, len as u64, written);
                let new_next = pack(straight_target, wrap);
                if self
                    .next_atomic()
                    .compare_exchange(raw, new_next, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                self.seen_atomic(worker).store(new_next, Ordering::Release);
                return Ok(Reservation { ring: self, worker, offset: off as usize, len });
            }

            // Wrap: the new reservation starts at offset 0 in the next
            // generation; anything left in [off, capacity) is dead space,
            // recorded via `end` once the CAS below commits.
            if len as u64 > written {
                self.seen_atomic(worker).store(u64::MAX, Ordering::Release);
                return Err(HopError::RingFull);
            }
            debug_assert_no_overtake!(len as u64, written);
            let locked_next = pack(len as u64, wrap.wrapping_add(1)) | WRAP_LOCK_BIT;
            if self
                .next_atomic()
                .compare_exchange(raw, locked_next, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            self.end_atomic().store(off, Ordering::Relaxed);
            let unlocked_next = locked_next & !WRAP_LOCK_BIT;
            self.next_atomic().store(unlocked_next, Ordering::Release);
            self.seen_atomic(worker).store(unlocked_next, Ordering::Release);
            return Ok(Reservation { ring: self, worker, offset: 0, len });
        }
    }

    /// §4.2 `produce`: marks `worker`'s reservation as fully written and no
    /// longer a blocker for the consumer's minimum computation.
    fn produce(&self, worker: usize) {
        self.seen_atomic(worker).store(u64::MAX, Ordering::Release);
    }

    /// §4.2 `consume`: returns the number of bytes now safely readable
    /// starting at the current `written` offset.
    pub fn readable(&self) -> usize {
        loop {
            let raw_next = self.next_atomic().load(Ordering::Acquire);
            if is_locked(raw_next) {
                return 0;
            }
            let next = offset_of(raw_next);
            let written = self.written_atomic().load(Ordering::Acquire);

            if next < written {
                let end = self.end_atomic().load(Ordering::Relaxed);
                let any_inflight =
                    (0..self.max_workers).any(|i| self.seen_atomic(i).load(Ordering::Acquire) != u64::MAX);
                if written == end && !any_inflight {
                    self.written_atomic().store(0, Ordering::Release);
                    continue;
                }
                return end.saturating_sub(written) as usize;
            }

            if next == written {
                return 0;
            }

            let mut ready = next;
            for i in 0..self.max_workers {
                let v = self.seen_atomic(i).load(Ordering::Acquire);
                if v != u64::MAX {
                    ready = ready.min(offset_of(v));
                }
            }
            return ready.saturating_sub(written) as usize;
        }
    }

    /// Borrows the currently-readable bytes starting at `written`, for the
    /// consumer to parse in place before calling [`Ring::release`].
    pub fn peek(&self, len: usize) -> &[u8] {
        let written = self.written_atomic().load(Ordering::Acquire) as usize;
        // SAFETY: `len` was bounded by a prior `readable()` call, and the
        // consumer is the only reader of [written, written+len).
        unsafe { self.data(written, len) }
    }

    /// §4.2 `release`: advances `written` by `n` after the consumer has
    /// copied/parsed that many bytes out of [`Ring::peek`].
    pub fn release(&self, n: usize) {
        let old = self.written_atomic().load(Ordering::Relaxed);
        let new = old + n as u64;
        debug_assert_monotonic!("written", old, new);
        self.written_atomic().store(new, Ordering::Release);
    }
}

/// A granted byte range, pending commit. Dropping without calling
/// [`Reservation::commit`] leaks the slot (the consumer will wait
/// forever for `produce`); callers must always commit.
pub struct Reservation<'a> {
    ring: &'a Ring,
    worker: usize,
    offset: usize,
    len: usize,
}

impl<'a> Reservation<'a> {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: this range was exclusively granted by `acquire` and no
        // other reservation may overlap it.
        unsafe { self.ring.data_mut(self.offset, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn commit(self) {
        self.ring.produce(self.worker);
    }
}
