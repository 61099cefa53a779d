//! Level-of-detail index (C8), §4.6.
//!
//! Keeps, per LOD level, a sorted-by-`end` array of [`LodInfo`] entries
//! that merge short, dense traces so rendering cost stays roughly constant
//! across zoom scales. Entries arrive depth-first as a thread's traces are
//! appended; the "latest in-progress" entry per `(level, depth)` decides
//! whether the next arrival merges or starts a new entry.

use std::collections::HashMap;

/// One level's merge thresholds, derived from display resolution at the
/// level the caller chooses to build for.
#[derive(Debug, Clone, Copy)]
pub struct LevelThresholds {
    pub lod_cycles: u64,
    pub min_trace_cycles: u64,
    pub min_gap_cycles: u64,
}

/// Default ladder of ~7 levels, each roughly 8x coarser than the last.
/// `min_trace_cycles`/`min_gap_cycles` scale with `lod_cycles` since both
/// are meant to stay "a few pixels wide" at that level's zoom.
pub fn default_levels() -> Vec<LevelThresholds> {
    let mut levels = Vec::with_capacity(7);
    let mut lod_cycles = 64u64;
    for _ in 0..7 {
        levels.push(LevelThresholds {
            lod_cycles,
            min_trace_cycles: lod_cycles / 4,
            min_gap_cycles: lod_cycles / 8,
        });
        lod_cycles = lod_cycles.saturating_mul(8);
    }
    levels
}

/// §3 `LodInfo`: `{start, end, trace_index, depth, loded}`. `loded` means
/// this entry aggregates multiple source traces. A level's output array is
/// ordered by `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LodInfo {
    pub start: u64,
    pub end: u64,
    pub trace_index: usize,
    pub depth: u16,
    pub loded: bool,
}

struct Level {
    thresholds: LevelThresholds,
    in_progress: HashMap<u16, LodInfo>,
    output: Vec<LodInfo>,
    sorted_len: usize,
}

impl Level {
    fn new(thresholds: LevelThresholds) -> Self {
        Self { thresholds, in_progress: HashMap::new(), output: Vec::new(), sorted_len: 0 }
    }

    /// §4.6: merge the new `(start, end, depth, trace_index)` into the
    /// latest in-progress entry at this depth, or open a new one.
    fn insert(&mut self, start: u64, end: u64, depth: u16, trace_index: usize) {
        let delta = end.saturating_sub(start);
        let t = self.thresholds;

        if let Some(prev) = self.in_progress.get_mut(&depth) {
            let prev_delta = prev.end.saturating_sub(prev.start);
            let gap = start.abs_diff(prev.end);
            if prev_delta < t.min_trace_cycles && delta < t.min_trace_cycles && gap < t.min_gap_cycles {
                prev.end = end;
                prev.loded = true;
                return;
            }
            let finished = *prev;
            self.output.push(finished);
            *prev = LodInfo { start, end, trace_index, depth, loded: false };
        } else {
            self.in_progress.insert(depth, LodInfo { start, end, trace_index, depth, loded: false });
        }
    }

    /// §4.6: "after a batch append, each level's suffix is re-sorted by
    /// `end` (insertion sort, since the new tail is already nearly
    /// sorted)". Entries still open (`in_progress`) are not part of
    /// `output` yet and so don't need sorting.
    fn finish_batch(&mut self) {
        for i in self.sorted_len..self.output.len() {
            let mut j = i;
            while j > 0 && self.output[j - 1].end > self.output[j].end {
                self.output.swap(j - 1, j);
                j -= 1;
            }
        }
        self.sorted_len = self.output.len();
    }

    /// §4.6 visible-index-span query: lower/upper bound by `end`, then
    /// advance `hi` to the next depth-0 entry so a shallow enclosing trace
    /// spanning the query window is never truncated mid-range.
    fn visible_span(&self, t0: u64, t1: u64) -> (usize, usize) {
        let arr = &self.output;
        let lo = arr.partition_point(|e| e.end < t0);
        let mut hi = arr.partition_point(|e| e.end <= t1);
        while hi < arr.len() && arr[hi].depth != 0 {
            hi += 1;
        }
        (lo, hi)
    }
}

/// Per-thread LOD index: one [`Level`] per configured threshold, each
/// holding its own in-progress-per-depth map and sorted output array.
pub struct LodIndex {
    levels: Vec<Level>,
}

impl LodIndex {
    pub fn new(thresholds: Vec<LevelThresholds>) -> Self {
        Self { levels: thresholds.into_iter().map(Level::new).collect() }
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Feeds one newly-arrived trace `(start, end, depth, trace_index)`
    /// into every level.
    pub fn insert(&mut self, start: u64, end: u64, depth: u16, trace_index: usize) {
        for level in &mut self.levels {
            level.insert(start, end, depth, trace_index);
        }
    }

    /// Call once after a batch of [`LodIndex::insert`] calls to re-sort
    /// each level's newly-pushed suffix.
    pub fn finish_batch(&mut self) {
        for level in &mut self.levels {
            level.finish_batch();
        }
    }

    pub fn output(&self, level: usize) -> &[LodInfo] {
        &self.levels[level].output
    }

    /// §4.6 visible-index-span query `(level, t0, t1) -> [lo, hi)`.
    pub fn visible_span(&self, level: usize, t0: u64, t1: u64) -> (usize, usize) {
        self.levels[level].visible_span(t0, t1)
    }

    /// "Choice of LOD level for rendering: smallest `L` with
    /// `LOD_CYCLES[L] >= visibleDuration`." Falls back to the coarsest
    /// level if none is wide enough.
    pub fn level_for_duration(&self, visible_duration: u64) -> usize {
        self.levels
            .iter()
            .position(|l| l.thresholds.lod_cycles >= visible_duration)
            .unwrap_or(self.levels.len().saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_level(min_trace_cycles: u64, min_gap_cycles: u64) -> LodIndex {
        LodIndex::new(vec![LevelThresholds { lod_cycles: u64::MAX, min_trace_cycles, min_gap_cycles }])
    }

    /// §8 scenario 5: `(0,10), (11,20), (100,105), (106,108)` under
    /// `minTraceCycles=50`, `minGapCycles=10` merges into `(0,20)` and
    /// `(100,108)`, both `loded=true`. A later, unmergeable arrival is
    /// needed to flush the second in-progress entry into `output`.
    #[test]
    fn scenario_lod_build_merges_into_two_entries() {
        let mut idx = single_level(50, 10);
        idx.insert(0, 10, 0, 0);
        idx.insert(11, 20, 0, 1);
        idx.insert(100, 105, 0, 2);
        idx.insert(106, 108, 0, 3);
        // Force the second in-progress entry to flush by inserting a third
        // group far enough away to break both thresholds.
        idx.insert(10_000, 10_001, 0, 4);
        idx.finish_batch();

        let out = idx.output(0);
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].start, out[0].end, out[0].loded), (0, 20, true));
        assert_eq!((out[1].start, out[1].end, out[1].loded), (100, 108, true));
    }

    #[test]
    fn entries_outside_thresholds_stay_separate() {
        let mut idx = single_level(5, 5);
        idx.insert(0, 100, 0, 0); // duration 100 >= min_trace_cycles, never merges
        idx.insert(200, 300, 0, 1);
        idx.insert(1_000_000, 1_000_001, 0, 2); // forces the second to flush
        idx.finish_batch();

        let out = idx.output(0);
        assert_eq!(out.len(), 2);
        assert!(!out[0].loded);
        assert!(!out[1].loded);
    }

    #[test]
    fn output_stays_sorted_by_end_after_batches() {
        let mut idx = single_level(1, 1);
        for depth in 0..4u16 {
            idx.insert(depth as u64 * 1000, depth as u64 * 1000 + 1, depth, depth as usize);
        }
        // Flush everything by inserting an unmergeable follow-up per depth.
        for depth in 0..4u16 {
            idx.insert(depth as u64 * 1000 + 500, depth as u64 * 1000 + 501, depth, 100 + depth as usize);
        }
        idx.finish_batch();
        let out = idx.output(0);
        for w in out.windows(2) {
            assert!(w[0].end <= w[1].end);
        }
    }

    /// visible_span is monotone in both endpoints.
    #[test]
    fn visible_span_is_monotone() {
        let mut idx = single_level(1, 1);
        for i in 0..20u64 {
            idx.insert(i * 100, i * 100 + 50, 0, i as usize);
            idx.insert(i * 100 + 1000, i * 100 + 1050, 0, 1000 + i as usize);
        }
        idx.finish_batch();

        let (lo1, hi1) = idx.visible_span(0, 100, 500);
        let (lo2, hi2) = idx.visible_span(0, 50, 600);
        assert!(lo2 <= lo1);
        assert!(hi2 >= hi1);
    }

    #[test]
    fn visible_span_extends_past_enclosing_depth_zero_entry() {
        let mut idx = single_level(1, 1);
        idx.insert(0, 1000, 0, 0); // a long depth-0 entry enclosing the query window
        idx.insert(100, 200, 1, 1);
        idx.insert(5000, 5001, 0, 2); // flush
        idx.finish_batch();

        let (_, hi) = idx.visible_span(0, 150, 180);
        assert!(hi >= 1, "must not truncate the enclosing depth-0 entry");
    }
}
