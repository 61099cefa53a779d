//! Per-thread aggregate: traces (live + spilled via C7), lock-waits,
//! unlocks, core events, string bytes and the LOD index (C8). §3
//! `ThreadTimeline`.

use crate::error::IntakeError;
use crate::lod::{default_levels, LodIndex, LodInfo};
use crate::spill::{SpillStore, SpillView};
use hop::strings::StrId;
use hop::wire::{CoreEventRecord, LockWaitRecord, TraceRecord, UnlockRecord};
use std::collections::HashMap;

/// Once a thread's live trace buffer holds more than this many entries,
/// the oldest are moved to the block-streamed spill store (C7).
pub const DEFAULT_SPILL_THRESHOLD: usize = 4096;

pub struct ThreadTimeline {
    pub thread_index: u32,
    pub thread_id: u64,
    pub thread_name: Option<String>,

    live_traces: Vec<TraceRecord>,
    spill: Option<SpillStore<TraceRecord>>,
    spill_threshold: usize,

    lock_waits: Vec<LockWaitRecord>,
    unlocks: Vec<UnlockRecord>,
    core_events: Vec<CoreEventRecord>,

    strings: HashMap<StrId, Vec<u8>>,

    /// §9 open question resolution: `max(depths)` over the live trace
    /// array, recomputed on every append (not maintained incrementally).
    max_depth: u16,

    lod: LodIndex,
}

impl ThreadTimeline {
    pub fn new(thread_index: u32, thread_id: u64) -> Self {
        Self::with_spill_threshold(thread_index, thread_id, DEFAULT_SPILL_THRESHOLD)
    }

    pub fn with_spill_threshold(thread_index: u32, thread_id: u64, spill_threshold: usize) -> Self {
        Self {
            thread_index,
            thread_id,
            thread_name: None,
            live_traces: Vec::new(),
            spill: None,
            spill_threshold,
            lock_waits: Vec::new(),
            unlocks: Vec::new(),
            core_events: Vec::new(),
            strings: HashMap::new(),
            max_depth: 0,
            lod: LodIndex::new(default_levels()),
        }
    }

    pub fn max_depth(&self) -> u16 {
        self.max_depth
    }

    pub fn trace_len(&self) -> usize {
        self.spilled_len() + self.live_traces.len()
    }

    fn spilled_len(&self) -> usize {
        self.spill.as_ref().map_or(0, SpillStore::size)
    }

    pub fn live_traces(&self) -> &[TraceRecord] {
        &self.live_traces
    }

    pub fn lod(&self) -> &LodIndex {
        &self.lod
    }

    pub fn lock_waits(&self) -> &[LockWaitRecord] {
        &self.lock_waits
    }

    pub fn unlocks(&self) -> &[UnlockRecord] {
        &self.unlocks
    }

    pub fn core_events(&self) -> &[CoreEventRecord] {
        &self.core_events
    }

    pub fn string_bytes(&self, id: StrId) -> Option<&[u8]> {
        self.strings.get(&id).map(Vec::as_slice)
    }

    /// §4.7 `STRING_DATA`: append payload bytes to this thread's string
    /// database.
    pub fn install_string(&mut self, id: StrId, bytes: &[u8]) {
        self.strings.insert(id, bytes.to_vec());
    }

    pub fn set_name(&mut self, name: String) {
        self.thread_name = Some(name);
    }

    /// §4.7 `TRACE`: append to the trace timeline (spilling older blocks
    /// via C7 once over budget) and feed C8.
    pub fn append_traces(&mut self, records: &[TraceRecord]) -> Result<(), IntakeError> {
        let base_index = self.trace_len();
        for (i, r) in records.iter().enumerate() {
            self.lod.insert(r.start, r.end, r.depth, base_index + i);
        }
        self.lod.finish_batch();

        self.live_traces.extend_from_slice(records);
        self.max_depth = self.live_traces.iter().map(|r| r.depth).max().unwrap_or(0);

        if self.live_traces.len() > self.spill_threshold {
            let overflow = self.live_traces.len() - self.spill_threshold;
            let moved: Vec<TraceRecord> = self.live_traces.drain(0..overflow).collect();
            let store = match &mut self.spill {
                Some(s) => s,
                None => {
                    self.spill = Some(SpillStore::new()?);
                    self.spill.as_mut().unwrap()
                }
            };
            store.append(&moved)?;
        }
        Ok(())
    }

    pub fn append_lock_waits(&mut self, records: Vec<LockWaitRecord>) {
        self.lock_waits.extend(records);
    }

    pub fn append_unlocks(&mut self, records: Vec<UnlockRecord>) {
        self.unlocks.extend(records);
    }

    pub fn append_core_events(&mut self, records: Vec<CoreEventRecord>) {
        self.core_events.extend(records);
    }

    /// Random access across the live/spilled boundary, transparent to the
    /// caller — `idx` is a global trace index as handed out by
    /// [`ThreadTimeline::append_traces`] and stored in [`LodInfo::trace_index`].
    pub fn trace_at(&mut self, idx: usize) -> Result<TraceRecord, IntakeError> {
        let spilled = self.spilled_len();
        if idx < spilled {
            let store = self.spill.as_ref().expect("spilled_len > 0 implies a spill store exists");
            let mut view: SpillView<TraceRecord> = store.view()?;
            let mut got = view.read_range(idx, 1)?;
            got.pop().ok_or(IntakeError::IndexOutOfRange { index: idx, len: self.trace_len() })
        } else {
            self.live_traces
                .get(idx - spilled)
                .copied()
                .ok_or(IntakeError::IndexOutOfRange { index: idx, len: self.trace_len() })
        }
    }

    pub fn lod_entry(&self, level: usize, slot: usize) -> Option<&LodInfo> {
        self.lod.output(level).get(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(start: u64, end: u64, depth: u16) -> TraceRecord {
        TraceRecord { start, end, file_id: 1, fn_id: 2, line: 10, depth, zone: 0 }
    }

    #[test]
    fn appends_feed_lod_and_track_max_depth() {
        let mut t = ThreadTimeline::new(0, 123);
        t.append_traces(&[trace(0, 10, 0), trace(1, 9, 1)]).unwrap();
        assert_eq!(t.max_depth(), 1);
        assert_eq!(t.trace_len(), 2);
    }

    #[test]
    fn overflow_spills_oldest_blocks_and_stays_readable() {
        let mut t = ThreadTimeline::with_spill_threshold(0, 1, 16);
        let mut expected = Vec::new();
        for i in 0..100u64 {
            let r = trace(i, i + 1, 0);
            expected.push(r);
            t.append_traces(&[r]).unwrap();
        }
        assert_eq!(t.trace_len(), 100);
        for i in 0..100usize {
            assert_eq!(t.trace_at(i).unwrap(), expected[i]);
        }
    }

    #[test]
    fn string_lookup_round_trips() {
        let mut t = ThreadTimeline::new(0, 1);
        t.install_string(7, b"hello");
        assert_eq!(t.string_bytes(7), Some(&b"hello"[..]));
    }
}
