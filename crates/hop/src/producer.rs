//! Per-thread producer state (C4) and the producer public API (C5).

use crate::clock::{self, ClockSource, Timestamp};
use crate::config::Config;
use crate::error::HopError;
use crate::invariants::{debug_assert_interned, debug_assert_stack_balanced};
use crate::metrics::Metrics;
use crate::segment::Segment;
use crate::strings::{hash_str, StrId, StringTable};
use crate::wire::{
    self, CoreEventRecord, LockWaitRecord, MsgInfo, MsgKind, TraceRecord, UnlockRecord,
};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

const INVALID_IDX: u64 = u64::MAX;

/// Parallel-column trace stack (§4.4). While a trace is open, `ends[i]`
/// holds the back-index of its parent slot rather than a timestamp — the
/// self-referential back-index trick from §9, avoiding a separate
/// per-thread parent stack.
#[derive(Default)]
struct TraceStack {
    starts: Vec<Timestamp>,
    ends: Vec<u64>,
    file_ids: Vec<StrId>,
    fn_ids: Vec<StrId>,
    lines: Vec<u32>,
    depths: Vec<u16>,
    zones: Vec<u16>,
    open_top: u64,
}

impl TraceStack {
    fn new() -> Self {
        Self { open_top: INVALID_IDX, ..Default::default() }
    }

    fn clear(&mut self) {
        self.starts.clear();
        self.ends.clear();
        self.file_ids.clear();
        self.fn_ids.clear();
        self.lines.clear();
        self.depths.clear();
        self.zones.clear();
        self.open_top = INVALID_IDX;
    }

    fn push_open(
        &mut self,
        start: Timestamp,
        file_id: StrId,
        fn_id: StrId,
        line: u32,
        depth: u16,
        zone: u16,
    ) {
        let idx = self.starts.len() as u64;
        self.starts.push(start);
        self.ends.push(self.open_top);
        self.file_ids.push(file_id);
        self.fn_ids.push(fn_id);
        self.lines.push(line);
        self.depths.push(depth);
        self.zones.push(zone);
        self.open_top = idx;
    }

    /// Closes the innermost open trace, returning its new depth-0-relative
    /// parent (or `INVALID_IDX` if none remains open).
    fn close_top(&mut self, now: Timestamp) {
        let i = self.open_top as usize;
        self.open_top = self.ends[i];
        self.ends[i] = now;
    }

    fn len(&self) -> usize {
        self.starts.len()
    }

    fn max_depth(&self) -> u16 {
        self.depths.iter().copied().max().unwrap_or(0)
    }

    fn as_records(&self) -> Vec<TraceRecord> {
        (0..self.len())
            .map(|i| TraceRecord {
                start: self.starts[i],
                end: self.ends[i],
                file_id: self.file_ids[i],
                fn_id: self.fn_ids[i],
                line: self.lines[i],
                depth: self.depths[i],
                zone: self.zones[i],
            })
            .collect()
    }
}

#[derive(Default)]
struct LockWaitStack {
    mutexes: Vec<u64>,
    starts: Vec<Timestamp>,
    ends: Vec<u64>,
    depths: Vec<u16>,
    open_top: u64,
}

impl LockWaitStack {
    fn new() -> Self {
        Self { open_top: INVALID_IDX, ..Default::default() }
    }

    fn clear(&mut self) {
        self.mutexes.clear();
        self.starts.clear();
        self.ends.clear();
        self.depths.clear();
        self.open_top = INVALID_IDX;
    }

    fn push_open(&mut self, mutex: u64, start: Timestamp, depth: u16) {
        let idx = self.starts.len() as u64;
        self.mutexes.push(mutex);
        self.starts.push(start);
        self.ends.push(self.open_top);
        self.depths.push(depth);
        self.open_top = idx;
    }

    /// Pops the top lock-wait, dropping it if its duration is below
    /// `min_cycles` (§4.4 `lock_acquired`).
    fn pop_and_close(&mut self, now: Timestamp, min_cycles: u64) {
        let i = self.open_top as usize;
        self.open_top = self.ends[i];
        self.ends[i] = now;
        if clock::cycles(now).saturating_sub(clock::cycles(self.starts[i])) < min_cycles {
            self.mutexes.truncate(i);
            self.starts.truncate(i);
            self.ends.truncate(i);
            self.depths.truncate(i);
        }
    }

    fn len(&self) -> usize {
        self.starts.len()
    }

    fn as_records(&self) -> Vec<LockWaitRecord> {
        (0..self.len())
            .map(|i| LockWaitRecord {
                mutex: self.mutexes[i],
                start: self.starts[i],
                end: self.ends[i],
                depth: self.depths[i],
            })
            .collect()
    }
}

/// Process-wide producer singleton: the attached segment, shared metrics,
/// clock source, and the atomic thread-index counter (§4.4 "thread index,
/// dense, assigned by atomic counter, capped at max_threads").
pub struct ProfilerProducer {
    segment: Arc<Segment>,
    metrics: Arc<Metrics>,
    clock: ClockSource,
    next_thread_index: AtomicU32,
    config: Config,
}

static PRODUCER: OnceLock<Arc<ProfilerProducer>> = OnceLock::new();

/// C5 `initialize()`: create or attach the segment for the current
/// process. Returns `true` on success. Safe to call more than once; later
/// calls are no-ops once a producer is already installed.
pub fn initialize(config: Config) -> bool {
    if PRODUCER.get().is_some() {
        return true;
    }
    let pid = std::process::id();
    match Segment::create(&config, pid) {
        Ok(segment) => {
            let producer = Arc::new(ProfilerProducer {
                segment: Arc::new(segment),
                metrics: Arc::new(Metrics::new()),
                clock: ClockSource::detect(),
                next_thread_index: AtomicU32::new(0),
                config,
            });
            // `OnceLock::set` losing a race just means another thread won
            // initialization first, which is also success.
            let _ = PRODUCER.set(producer);
            true
        }
        Err(e) => {
            log::error!("hop: failed to initialize shared segment: {e}");
            false
        }
    }
}

/// C5 `shutdown()`: detach from the segment. §7: producer calls never
/// propagate errors, so this returns nothing.
pub fn shutdown() {
    if let Some(p) = PRODUCER.get() {
        p.segment.disconnect_producer();
    }
}

pub fn metrics() -> Option<Arc<Metrics>> {
    PRODUCER.get().map(|p| Arc::clone(&p.metrics))
}

struct ThreadState {
    producer: Arc<ProfilerProducer>,
    worker: usize,
    thread_index: u32,
    thread_id: u64,
    thread_name: Option<StrId>,
    thread_name_bytes: Option<Vec<u8>>,
    traces: TraceStack,
    lock_waits: LockWaitStack,
    unlocks: Vec<UnlockRecord>,
    core_events: Vec<CoreEventRecord>,
    strings: StringTable,
    last_reset_seen: u64,
    current_depth: u16,
    current_zone: u16,
}

impl ThreadState {
    fn new(producer: Arc<ProfilerProducer>) -> Self {
        let worker = producer.segment.ring().register_worker();
        let thread_index = producer.next_thread_index.fetch_add(1, Ordering::Relaxed);
        Self {
            producer,
            worker,
            thread_index,
            thread_id: thread_id_u64(),
            thread_name: None,
            thread_name_bytes: None,
            traces: TraceStack::new(),
            lock_waits: LockWaitStack::new(),
            unlocks: Vec::new(),
            core_events: Vec::new(),
            strings: StringTable::new(),
            last_reset_seen: 0,
            current_depth: 0,
            current_zone: 0,
        }
    }

    fn now(&self) -> Timestamp {
        clock::now(self.producer.clock)
    }

    fn intern_static(&mut self, ptr_id: StrId, s: &[u8]) {
        if ptr_id != 0 {
            self.strings.intern(ptr_id, s);
        }
    }

    fn enter(&mut self, file: (StrId, &[u8]), line: u32, function: (StrId, &[u8]), dynamic: bool) {
        self.intern_static(file.0, file.1);
        self.intern_static(function.0, function.1);
        debug_assert_interned!(self.strings, file.0);
        debug_assert_interned!(self.strings, function.0);

        let depth = self.current_depth;
        self.current_depth += 1;
        let mut start = self.now();
        if dynamic {
            start = clock::with_dynamic_flag(start);
        }
        self.traces.push_open(start, file.0, function.0, line, depth, self.current_zone);
    }

    fn leave(&mut self) {
        let now = self.now();
        self.traces.close_top(now);
        self.current_depth -= 1;
        if self.current_depth == 0 {
            debug_assert_stack_balanced!(self.current_depth);
            self.flush();
        }
    }

    fn acquire_lock(&mut self, mutex: u64) {
        let now = self.now();
        self.lock_waits.push_open(mutex, now, self.current_depth);
    }

    fn lock_acquired(&mut self) {
        let now = self.now();
        self.lock_waits.pop_and_close(now, self.producer.config.min_lock_wait_cycles);
    }

    fn release_lock(&mut self, mutex: u64) {
        self.unlocks.push(UnlockRecord { mutex, time: self.now() });
    }

    fn set_thread_name(&mut self, name: &str) {
        let id = hash_str(name.as_bytes());
        self.strings.intern(id, name.as_bytes());
        self.thread_name = Some(id);
        self.thread_name_bytes = Some(name.as_bytes().to_vec());
    }

    /// §4.4 `flush`.
    fn flush(&mut self) {
        let segment_reset_ts = self.producer.segment.header().last_reset_timestamp();
        if self.last_reset_seen < segment_reset_ts {
            self.strings.reset();
            self.traces.clear();
            self.lock_waits.clear();
            self.unlocks.clear();
            self.core_events.clear();
            self.last_reset_seen = segment_reset_ts;
            // Scenario 2 (§8): a reset must not just drop the string DB,
            // it must re-emit the thread name on the next flush so the
            // consumer's rebuilt view still has it.
            if let (Some(id), Some(bytes)) = (self.thread_name, &self.thread_name_bytes) {
                self.strings.intern(id, bytes);
            }
            return;
        }

        if self.traces.len() == 0
            && self.lock_waits.len() == 0
            && self.unlocks.is_empty()
            && self.core_events.is_empty()
        {
            return;
        }

        let ring = self.producer.segment.ring();
        let header = |kind: MsgKind, count: u32, time_stamp: Timestamp| MsgInfo {
            kind,
            thread_index: self.thread_index,
            thread_id: self.thread_id,
            time_stamp,
            thread_name: self.thread_name.unwrap_or(0),
            count,
        };

        let now = self.now();
        let mut batch = Vec::new();

        let unshipped = self.strings.unshipped();
        if !unshipped.is_empty() {
            header(MsgKind::StringData, unshipped.len() as u32, now).encode(&mut batch);
            batch.extend_from_slice(unshipped);
        }

        if self.traces.len() > 0 {
            let records = self.traces.as_records();
            header(MsgKind::Trace, records.len() as u32, now).encode(&mut batch);
            wire::encode_traces(&records, &mut batch);
        }

        if self.lock_waits.len() > 0 {
            let records = self.lock_waits.as_records();
            header(MsgKind::WaitLock, records.len() as u32, now).encode(&mut batch);
            wire::encode_lock_waits(&records, &mut batch);
        }

        if !self.unlocks.is_empty() {
            header(MsgKind::UnlockEvent, self.unlocks.len() as u32, now).encode(&mut batch);
            wire::encode_unlocks(&self.unlocks, &mut batch);
        }

        if !self.core_events.is_empty() {
            header(MsgKind::CoreEvent, self.core_events.len() as u32, now).encode(&mut batch);
            wire::encode_core_events(&self.core_events, &mut batch);
        }

        let trace_count = self.traces.len() as u64;
        match ring.acquire(self.worker, batch.len()) {
            Ok(mut reservation) => {
                reservation.as_mut_slice().copy_from_slice(&batch);
                reservation.commit();
                self.strings.mark_shipped();
                if self.producer.config.enable_metrics {
                    self.producer.metrics.record_flush(trace_count);
                }
            }
            Err(HopError::MessageTooLarge { len, capacity }) => {
                log::error!(
                    "hop: batch of {len} bytes exceeds ring capacity {capacity}; dropping batch"
                );
            }
            Err(_) => {
                // §4.4 step 4: acquire failure drops the batch silently
                // after a single diagnostic; the string table survives so
                // future batches do not re-send what was already shipped.
                log::warn!("hop: ring full, dropping batch of {trace_count} traces");
                if self.producer.config.enable_metrics {
                    self.producer.metrics.record_ring_full();
                }
            }
        }

        self.traces.clear();
        self.lock_waits.clear();
        self.unlocks.clear();
        self.core_events.clear();
        self.maybe_send_heartbeat(now);
    }

    fn maybe_send_heartbeat(&self, now: Timestamp) {
        let header = self.producer.segment.header();
        if !header.state.has(crate::segment::CONNECTED_CONSUMER) {
            return;
        }
        if header.state.has(crate::segment::LISTENING_CONSUMER) {
            return; // payload traffic already demonstrates liveness
        }
        let last = header.last_heartbeat_timestamp();
        if clock::cycles(now).saturating_sub(last) < self.producer.config.heartbeat_interval_cycles
        {
            return;
        }
        header.record_heartbeat(clock::cycles(now));
        if self.producer.config.enable_metrics {
            self.producer.metrics.record_heartbeat();
        }
    }
}

#[cfg(unix)]
fn thread_id_u64() -> u64 {
    // SAFETY: pthread_self() is always valid to call on the current thread.
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(not(unix))]
fn thread_id_u64() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

thread_local! {
    static STATE: RefCell<Option<ThreadState>> = const { RefCell::new(None) };
}

fn with_state<R>(f: impl FnOnce(&mut ThreadState) -> R) -> Option<R> {
    let producer = PRODUCER.get()?;
    STATE.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(ThreadState::new(Arc::clone(producer)));
        }
        Some(f(slot.as_mut().unwrap()))
    })
}

/// C5 `enter(file, line, fn)`: static-lifetime string pointers, identified
/// by address per §3.
pub fn enter(file: &'static str, line: u32, function: &'static str) {
    with_state(|s| {
        s.enter(
            (file.as_ptr() as u64, file.as_bytes()),
            line,
            (function.as_ptr() as u64, function.as_bytes()),
            false,
        )
    });
}

/// C5 `enter_dynamic(file, line, fn)`: `fn` is heap-owned; its id is the
/// content hash, and the dynamic-string flag is set on `start`.
pub fn enter_dynamic(file: &'static str, line: u32, function: &str) {
    let fn_id = hash_str(function.as_bytes());
    with_state(|s| s.enter((file.as_ptr() as u64, file.as_bytes()), line, (fn_id, function.as_bytes()), true));
}

/// C5 `leave()`.
pub fn leave() {
    with_state(ThreadState::leave);
}

/// C5 `acquire_lock(addr)`.
pub fn acquire_lock(mutex_addr: u64) {
    with_state(|s| s.acquire_lock(mutex_addr));
}

/// C5 `lock_acquired()`.
pub fn lock_acquired() {
    with_state(ThreadState::lock_acquired);
}

/// C5 `release_lock(addr)`.
pub fn release_lock(mutex_addr: u64) {
    with_state(|s| s.release_lock(mutex_addr));
}

/// C5 `set_thread_name(s)`: one-time per thread.
pub fn set_thread_name(name: &str) {
    with_state(|s| s.set_thread_name(name));
}
