//! Consumer intake (C6), §4.7.
//!
//! Drains the shared ring, parsing `MsgInfo` headers and their SoA
//! payloads, dispatching each message into the owning thread's
//! [`ThreadTimeline`]. Parsing errors are quarantined per message (§7):
//! the offending message is logged and skipped, draining resumes at the
//! next header.

use crate::error::IntakeError;
use crate::profiler::Profiler;
use hop::segment::Segment;
use hop::wire::{
    decode_core_events, decode_lock_waits, decode_string_data, decode_traces, decode_unlocks,
    MsgInfo, MsgKind, MSG_INFO_SIZE,
};

fn payload_len(kind: MsgKind, count: u32) -> usize {
    let count = count as usize;
    match kind {
        MsgKind::Trace => count * (8 + 8 + 8 + 8 + 4 + 2 + 2),
        MsgKind::WaitLock => count * (8 + 8 + 8 + 2 + 2),
        MsgKind::UnlockEvent => count * 16,
        MsgKind::CoreEvent => count * (8 + 8 + 4 + 4),
        MsgKind::StringData => count, // raw byte count, not a record count
        MsgKind::Heartbeat => 0,
    }
}

/// Dispatches one already-decoded message into `profiler`. §4.9: with
/// recording off, `TRACE`/`WAIT_LOCK`/`UNLOCK_EVENT` are dropped but
/// `STRING_DATA` still installs (so identifiers are never lost).
fn dispatch(profiler: &mut Profiler, info: &MsgInfo, payload: &[u8]) -> Result<(), IntakeError> {
    let recording = profiler.is_recording();

    match info.kind {
        MsgKind::StringData => {
            let thread = profiler.ensure_thread(info.thread_index, info.thread_id);
            for (id, bytes) in decode_string_data(payload) {
                thread.install_string(id, bytes);
            }
            if info.thread_name != 0 {
                if let Some(name) = thread.string_bytes(info.thread_name) {
                    if let Ok(name) = std::str::from_utf8(name) {
                        thread.set_name(name.to_string());
                    }
                }
            }
            Ok(())
        }
        MsgKind::Trace => {
            if !recording {
                return Ok(());
            }
            let records = decode_traces(payload, info.count as usize)
                .ok_or(IntakeError::TruncatedPayload { expected: payload_len(info.kind, info.count), got: payload.len() })?;
            profiler.ensure_thread(info.thread_index, info.thread_id).append_traces(&records)
        }
        MsgKind::WaitLock => {
            if !recording {
                return Ok(());
            }
            let records = decode_lock_waits(payload, info.count as usize)
                .ok_or(IntakeError::TruncatedPayload { expected: payload_len(info.kind, info.count), got: payload.len() })?;
            profiler.ensure_thread(info.thread_index, info.thread_id).append_lock_waits(records);
            Ok(())
        }
        MsgKind::UnlockEvent => {
            if !recording {
                return Ok(());
            }
            let records = decode_unlocks(payload, info.count as usize)
                .ok_or(IntakeError::TruncatedPayload { expected: payload_len(info.kind, info.count), got: payload.len() })?;
            profiler.ensure_thread(info.thread_index, info.thread_id).append_unlocks(records);
            Ok(())
        }
        MsgKind::CoreEvent => {
            let records = decode_core_events(payload, info.count as usize)
                .ok_or(IntakeError::TruncatedPayload { expected: payload_len(info.kind, info.count), got: payload.len() })?;
            profiler.ensure_thread(info.thread_index, info.thread_id).append_core_events(records);
            Ok(())
        }
        MsgKind::Heartbeat => {
            if profiler.thread(info.thread_index, info.thread_id).is_none() {
                return Err(IntakeError::UnknownThread(info.thread_index));
            }
            profiler.record_heartbeat(info.thread_index, info.time_stamp);
            Ok(())
        }
    }
}

/// Parses every complete `MsgInfo`+payload in `buf`, dispatching each into
/// `profiler`. Returns the number of bytes consumed (always `buf.len()`
/// when no decode error occurs) and the count of messages processed.
///
/// A decode failure aborts the parse for the rest of `buf` — the producer
/// always commits a whole, self-delimited batch in one ring reservation,
/// so a malformed header here means the batch itself is corrupt and the
/// remaining bytes cannot be resynchronized to a message boundary.
pub fn parse_batch(profiler: &mut Profiler, buf: &[u8]) -> (usize, usize) {
    let mut off = 0;
    let mut processed = 0;

    while off < buf.len() {
        let Some((info, rest)) = MsgInfo::decode(&buf[off..]) else {
            log::warn!("{}: at batch offset {off}, dropping remainder of batch", IntakeError::MalformedHeader);
            return (buf.len(), processed);
        };
        let need = payload_len(info.kind, info.count);
        if rest.len() < need {
            log::warn!(
                "truncated {:?} payload at offset {off}: need {need}, have {}",
                info.kind,
                rest.len()
            );
            return (buf.len(), processed);
        }
        let payload = &rest[..need];
        if let Err(e) = dispatch(profiler, &info, payload) {
            log::warn!("dropping malformed {:?} message: {e}", info.kind);
        } else {
            processed += 1;
        }
        off += MSG_INFO_SIZE + need;
    }
    (off, processed)
}

/// Drains everything currently readable from `segment`'s ring into
/// `profiler`, in one pass. Returns the number of messages processed.
/// Never blocks — callers poll this on a timer (§5 "may block on ring
/// emptiness only via a timed poll").
pub fn drain(segment: &Segment, profiler: &mut Profiler) -> usize {
    let ring = segment.ring();
    let readable = ring.readable();
    if readable == 0 {
        return 0;
    }
    let buf = ring.peek(readable).to_vec();
    let (consumed, processed) = parse_batch(profiler, &buf);
    ring.release(consumed);
    processed
}
