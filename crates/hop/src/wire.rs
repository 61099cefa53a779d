//! Message framing and Structure-of-Arrays payload encoding (§6).
//!
//! Every message on the ring begins with a [`MsgInfo`] header, followed by
//! a payload whose shape depends on `MsgInfo.kind`. Encoding is manual
//! little-endian byte packing rather than a derive-based serializer: the
//! wire format is a fixed, versioned C-compatible layout (it is read by a
//! consumer that may be a different process, possibly built from a
//! different commit), not a Rust-internal representation that a format
//! crate could freely renegotiate.

use crate::clock::Timestamp;
use crate::strings::StrId;

pub const MSG_INFO_SIZE: usize = 4 + 4 + 8 + 8 + 8 + 4; // kind+pad, threadIndex, threadId, timeStamp, threadName, count

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgKind {
    Trace = 0,
    StringData = 1,
    WaitLock = 2,
    UnlockEvent = 3,
    CoreEvent = 4,
    Heartbeat = 5,
}

impl MsgKind {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => MsgKind::Trace,
            1 => MsgKind::StringData,
            2 => MsgKind::WaitLock,
            3 => MsgKind::UnlockEvent,
            4 => MsgKind::CoreEvent,
            5 => MsgKind::Heartbeat,
            _ => return None,
        })
    }
}

/// Per-message header, §6: `{ kind, threadIndex, threadId, timeStamp,
/// threadName: StrId, count }`.
#[derive(Debug, Clone, Copy)]
pub struct MsgInfo {
    pub kind: MsgKind,
    pub thread_index: u32,
    pub thread_id: u64,
    pub time_stamp: Timestamp,
    pub thread_name: StrId,
    pub count: u32,
}

impl MsgInfo {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.kind as u32).to_le_bytes());
        out.extend_from_slice(&self.thread_index.to_le_bytes());
        out.extend_from_slice(&self.thread_id.to_le_bytes());
        out.extend_from_slice(&self.time_stamp.to_le_bytes());
        out.extend_from_slice(&self.thread_name.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<(Self, &[u8])> {
        if buf.len() < MSG_INFO_SIZE {
            return None;
        }
        let kind = MsgKind::from_u32(u32::from_le_bytes(buf[0..4].try_into().ok()?))?;
        let thread_index = u32::from_le_bytes(buf[4..8].try_into().ok()?);
        let thread_id = u64::from_le_bytes(buf[8..16].try_into().ok()?);
        let time_stamp = u64::from_le_bytes(buf[16..24].try_into().ok()?);
        let thread_name = u64::from_le_bytes(buf[24..32].try_into().ok()?);
        let count = u32::from_le_bytes(buf[32..36].try_into().ok()?);
        Some((
            MsgInfo { kind, thread_index, thread_id, time_stamp, thread_name, count },
            &buf[MSG_INFO_SIZE..],
        ))
    }
}

/// One producer-side trace record, pre-SoA-transposition (§3 `Trace`).
///
/// `Default` and `Copy` let the consumer spill these to disk in fixed-size
/// blocks (C7) without any serialization layer — see `hop_viewer::spill`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceRecord {
    pub start: Timestamp,
    pub end: Timestamp,
    pub file_id: StrId,
    pub fn_id: StrId,
    pub line: u32,
    pub depth: u16,
    pub zone: u16,
}

/// Encodes `records` as the SoA payload §6 describes for `TRACE`:
/// `starts[u64], ends[u64], file_ids[u64], fn_ids[u64], lines[u32],
/// depths[u16], zones[u16]`, each array tightly packed in that order.
pub fn encode_traces(records: &[TraceRecord], out: &mut Vec<u8>) {
    for r in records {
        out.extend_from_slice(&r.start.to_le_bytes());
    }
    for r in records {
        out.extend_from_slice(&r.end.to_le_bytes());
    }
    for r in records {
        out.extend_from_slice(&r.file_id.to_le_bytes());
    }
    for r in records {
        out.extend_from_slice(&r.fn_id.to_le_bytes());
    }
    for r in records {
        out.extend_from_slice(&r.line.to_le_bytes());
    }
    for r in records {
        out.extend_from_slice(&r.depth.to_le_bytes());
    }
    for r in records {
        out.extend_from_slice(&r.zone.to_le_bytes());
    }
}

pub fn decode_traces(buf: &[u8], count: usize) -> Option<Vec<TraceRecord>> {
    let need = count * (8 + 8 + 8 + 8 + 4 + 2 + 2);
    if buf.len() < need {
        return None;
    }
    let mut off = 0;
    let read_u64_col = |buf: &[u8], off: &mut usize, n: usize| -> Vec<u64> {
        let v = (0..n)
            .map(|i| u64::from_le_bytes(buf[*off + i * 8..*off + i * 8 + 8].try_into().unwrap()))
            .collect();
        *off += n * 8;
        v
    };
    let starts = read_u64_col(buf, &mut off, count);
    let ends = read_u64_col(buf, &mut off, count);
    let file_ids = read_u64_col(buf, &mut off, count);
    let fn_ids = read_u64_col(buf, &mut off, count);
    let lines: Vec<u32> = (0..count)
        .map(|i| u32::from_le_bytes(buf[off + i * 4..off + i * 4 + 4].try_into().unwrap()))
        .collect();
    off += count * 4;
    let depths: Vec<u16> = (0..count)
        .map(|i| u16::from_le_bytes(buf[off + i * 2..off + i * 2 + 2].try_into().unwrap()))
        .collect();
    off += count * 2;
    let zones: Vec<u16> = (0..count)
        .map(|i| u16::from_le_bytes(buf[off + i * 2..off + i * 2 + 2].try_into().unwrap()))
        .collect();

    Some(
        (0..count)
            .map(|i| TraceRecord {
                start: starts[i],
                end: ends[i],
                file_id: file_ids[i],
                fn_id: fn_ids[i],
                line: lines[i],
                depth: depths[i],
                zone: zones[i],
            })
            .collect(),
    )
}

/// `WAIT_LOCK`: `{ mutex: u64, start: u64, end: u64, depth: u16, pad: u16 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockWaitRecord {
    pub mutex: u64,
    pub start: Timestamp,
    pub end: Timestamp,
    pub depth: u16,
}

pub fn encode_lock_waits(records: &[LockWaitRecord], out: &mut Vec<u8>) {
    for r in records {
        out.extend_from_slice(&r.mutex.to_le_bytes());
        out.extend_from_slice(&r.start.to_le_bytes());
        out.extend_from_slice(&r.end.to_le_bytes());
        out.extend_from_slice(&r.depth.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
    }
}

pub fn decode_lock_waits(buf: &[u8], count: usize) -> Option<Vec<LockWaitRecord>> {
    const REC: usize = 8 + 8 + 8 + 2 + 2;
    if buf.len() < count * REC {
        return None;
    }
    Some(
        (0..count)
            .map(|i| {
                let b = &buf[i * REC..i * REC + REC];
                LockWaitRecord {
                    mutex: u64::from_le_bytes(b[0..8].try_into().unwrap()),
                    start: u64::from_le_bytes(b[8..16].try_into().unwrap()),
                    end: u64::from_le_bytes(b[16..24].try_into().unwrap()),
                    depth: u16::from_le_bytes(b[24..26].try_into().unwrap()),
                }
            })
            .collect(),
    )
}

/// `UNLOCK_EVENT`: `{ mutex: u64, time: u64 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockRecord {
    pub mutex: u64,
    pub time: Timestamp,
}

pub fn encode_unlocks(records: &[UnlockRecord], out: &mut Vec<u8>) {
    for r in records {
        out.extend_from_slice(&r.mutex.to_le_bytes());
        out.extend_from_slice(&r.time.to_le_bytes());
    }
}

pub fn decode_unlocks(buf: &[u8], count: usize) -> Option<Vec<UnlockRecord>> {
    const REC: usize = 16;
    if buf.len() < count * REC {
        return None;
    }
    Some(
        (0..count)
            .map(|i| {
                let b = &buf[i * REC..i * REC + REC];
                UnlockRecord {
                    mutex: u64::from_le_bytes(b[0..8].try_into().unwrap()),
                    time: u64::from_le_bytes(b[8..16].try_into().unwrap()),
                }
            })
            .collect(),
    )
}

/// `CORE_EVENT`: `{ start: u64, end: u64, core: u32 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreEventRecord {
    pub start: Timestamp,
    pub end: Timestamp,
    pub core: u32,
}

pub fn encode_core_events(records: &[CoreEventRecord], out: &mut Vec<u8>) {
    for r in records {
        out.extend_from_slice(&r.start.to_le_bytes());
        out.extend_from_slice(&r.end.to_le_bytes());
        out.extend_from_slice(&r.core.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
    }
}

pub fn decode_core_events(buf: &[u8], count: usize) -> Option<Vec<CoreEventRecord>> {
    const REC: usize = 8 + 8 + 4 + 4;
    if buf.len() < count * REC {
        return None;
    }
    Some(
        (0..count)
            .map(|i| {
                let b = &buf[i * REC..i * REC + REC];
                CoreEventRecord {
                    start: u64::from_le_bytes(b[0..8].try_into().unwrap()),
                    end: u64::from_le_bytes(b[8..16].try_into().unwrap()),
                    core: u32::from_le_bytes(b[16..20].try_into().unwrap()),
                }
            })
            .collect(),
    )
}

/// `STRING_DATA` payload: a sequence of `{ id: u64, str: NUL-terminated,
/// pad to 8-byte alignment }` records, encoded by [`crate::strings::StringTable`].
pub fn decode_string_data(buf: &[u8]) -> Vec<(StrId, &[u8])> {
    let mut out = Vec::new();
    let mut off = 0;
    while off + 8 <= buf.len() {
        let id = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let start = off;
        while off < buf.len() && buf[off] != 0 {
            off += 1;
        }
        let s = &buf[start..off];
        off += 1; // NUL
        off = (off + 7) & !7; // pad to 8-byte alignment
        out.push((id, s));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_info_roundtrips() {
        let info = MsgInfo {
            kind: MsgKind::Trace,
            thread_index: 3,
            thread_id: 0xABCD,
            time_stamp: 12345,
            thread_name: 99,
            count: 2,
        };
        let mut buf = Vec::new();
        info.encode(&mut buf);
        let (decoded, rest) = MsgInfo::decode(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded.kind, MsgKind::Trace);
        assert_eq!(decoded.thread_index, 3);
        assert_eq!(decoded.count, 2);
    }

    #[test]
    fn trace_soa_roundtrips() {
        let records = vec![
            TraceRecord { start: 1, end: 10, file_id: 100, fn_id: 200, line: 42, depth: 0, zone: 1 },
            TraceRecord { start: 11, end: 20, file_id: 100, fn_id: 201, line: 43, depth: 1, zone: 1 },
        ];
        let mut buf = Vec::new();
        encode_traces(&records, &mut buf);
        let decoded = decode_traces(&buf, records.len()).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn string_data_roundtrips() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&42u64.to_le_bytes()); // id
        buf.extend_from_slice(b"foo\0"); // 3 bytes + NUL
        buf.extend_from_slice(&[0u8; 4]); // pad up to the 16-byte record boundary
        let decoded = decode_string_data(&buf);
        assert_eq!(decoded[0].0, 42);
        assert_eq!(decoded[0].1, b"foo");
    }
}
