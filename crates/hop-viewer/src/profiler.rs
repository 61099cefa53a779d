//! Profiler aggregate (C10), §4.9.
//!
//! Owns every thread's [`ThreadTimeline`], the recording flag, the source
//! descriptor (live process or loaded file) and snapshot I/O.

use crate::error::IntakeError;
use crate::thread_timeline::ThreadTimeline;
use hop::segment::Segment;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Where a [`Profiler`]'s data is coming from.
#[derive(Debug, Clone)]
pub enum Source {
    /// Attached live to a running process's shared segment.
    Live { pid: u32 },
    /// Replayed from a snapshot file.
    File { path: PathBuf },
}

/// §3: a thread's timeline is keyed by `(thread_index, os_thread_id)`, not
/// `thread_index` alone — a worker slot can be reassigned to a different
/// OS thread after its previous occupant exits, and the two must not
/// collide into one timeline.
type ThreadKey = (u32, u64);

pub struct Profiler {
    threads: BTreeMap<ThreadKey, ThreadTimeline>,
    recording: bool,
    source: Option<Source>,
    last_heartbeat: BTreeMap<u32, u64>,
}

impl Profiler {
    pub fn new() -> Self {
        Self {
            threads: BTreeMap::new(),
            recording: true,
            source: None,
            last_heartbeat: BTreeMap::new(),
        }
    }

    /// Attaches to the shared segment a producer with pid `pid` has
    /// already created, returning both the live [`Profiler`] and the
    /// [`Segment`] handle `intake::drain` polls. Fails the same way
    /// [`hop::segment::Segment::attach`] does: no such segment
    /// (`NotConnected`), a permissions problem, or an incompatible
    /// producer version.
    pub fn attach_live(pid: u32) -> Result<(Self, Segment), IntakeError> {
        let segment = Segment::attach(pid)?;
        let mut p = Self::new();
        p.source = Some(Source::Live { pid });
        Ok((p, segment))
    }

    pub fn source(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// §4.9: toggling recording off does not drop already-buffered data,
    /// only future `TRACE`/`WAIT_LOCK`/`UNLOCK_EVENT` inbound payloads
    /// (enforced in `intake::dispatch`).
    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    pub fn thread(&self, thread_index: u32, thread_id: u64) -> Option<&ThreadTimeline> {
        self.threads.get(&(thread_index, thread_id))
    }

    pub fn threads(&self) -> impl Iterator<Item = &ThreadTimeline> {
        self.threads.values()
    }

    pub fn ensure_thread(&mut self, thread_index: u32, thread_id: u64) -> &mut ThreadTimeline {
        self.threads
            .entry((thread_index, thread_id))
            .or_insert_with(|| ThreadTimeline::new(thread_index, thread_id))
    }

    pub fn record_heartbeat(&mut self, thread_index: u32, timestamp: u64) {
        self.last_heartbeat.insert(thread_index, timestamp);
    }

    pub fn last_heartbeat(&self, thread_index: u32) -> Option<u64> {
        self.last_heartbeat.get(&thread_index).copied()
    }

    /// Writes every thread's currently-live data to a single snapshot
    /// file, re-encoded in the same `MsgInfo`+payload framing used on the
    /// live ring, so [`Profiler::load_snapshot`] can replay it through the
    /// same intake path as a live drain. Data already moved to a thread's
    /// disk spill (C7) is not included. Compression is an explicit
    /// external collaborator (§4.9) — none is applied here.
    pub fn save_snapshot(&self, path: &Path) -> Result<(), IntakeError> {
        use hop::wire::{encode_traces, MsgInfo, MsgKind};

        let mut out = Vec::new();
        for thread in self.threads.values() {
            let traces = thread.live_traces();
            if traces.is_empty() {
                continue;
            }
            let info = MsgInfo {
                kind: MsgKind::Trace,
                thread_index: thread.thread_index,
                thread_id: thread.thread_id,
                time_stamp: 0,
                thread_name: 0,
                count: traces.len() as u32,
            };
            info.encode(&mut out);
            encode_traces(traces, &mut out);
        }
        let mut f = File::create(path)?;
        f.write_all(&out)?;
        Ok(())
    }

    /// Loads a snapshot file written by [`Profiler::save_snapshot`],
    /// replaying it through the same dispatch path as a live drain.
    pub fn load_snapshot(path: &Path) -> Result<Self, IntakeError> {
        let mut profiler = Self::new();
        profiler.source = Some(Source::File { path: path.to_path_buf() });
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        crate::intake::parse_batch(&mut profiler, &bytes);
        Ok(profiler)
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_thread_is_idempotent_per_index() {
        let mut p = Profiler::new();
        p.ensure_thread(0, 111);
        p.ensure_thread(0, 111);
        assert_eq!(p.threads().count(), 1);
    }

    #[test]
    fn same_thread_index_with_different_thread_id_does_not_collide() {
        // §3: the timeline set is keyed by (thread_index, os_thread_id) —
        // a worker slot reused by a different OS thread must not merge
        // into the previous occupant's timeline.
        let mut p = Profiler::new();
        p.ensure_thread(0, 111);
        p.ensure_thread(0, 222);
        assert_eq!(p.threads().count(), 2);
        assert_eq!(p.thread(0, 111).unwrap().thread_id, 111);
        assert_eq!(p.thread(0, 222).unwrap().thread_id, 222);
    }

    #[test]
    fn recording_toggles_without_dropping_existing_data() {
        let mut p = Profiler::new();
        p.ensure_thread(0, 1)
            .append_traces(&[hop::wire::TraceRecord { start: 0, end: 1, file_id: 1, fn_id: 1, line: 1, depth: 0, zone: 0 }])
            .unwrap();
        p.set_recording(false);
        assert_eq!(p.thread(0, 1).unwrap().trace_len(), 1);
        assert!(!p.is_recording());
    }

    #[test]
    fn snapshot_round_trips_live_traces() {
        let mut p = Profiler::new();
        p.ensure_thread(2, 99)
            .append_traces(&[
                hop::wire::TraceRecord { start: 0, end: 5, file_id: 1, fn_id: 1, line: 1, depth: 0, zone: 0 },
                hop::wire::TraceRecord { start: 1, end: 4, file_id: 1, fn_id: 2, line: 2, depth: 1, zone: 0 },
            ])
            .unwrap();

        let path = std::env::temp_dir().join(format!("hop-viewer-snapshot-test-{}", std::process::id()));
        p.save_snapshot(&path).unwrap();
        let loaded = Profiler::load_snapshot(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.thread(2, 99).unwrap().trace_len(), 2);
        assert_eq!(loaded.thread(2, 99).unwrap().live_traces(), p.thread(2, 99).unwrap().live_traces());
    }
}
