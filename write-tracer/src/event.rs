//! Decoding and rendering of ring buffer records.
//!
//! Records arrive from the kernel as fixed-size byte blobs in the target
//! ABI's layout. Decoding is a length check plus an unaligned read; rendering
//! produces one JSON object per event. Payload bytes are opaque: they are
//! never required to be UTF-8 and invalid sequences are escaped or replaced
//! when the line is built.

use std::borrow::Cow;
use std::mem;

use serde::Serialize;
use thiserror::Error;
use write_tracer_common::WriteEvent;

/// Exact size of one ring record.
pub const EVENT_SIZE: usize = mem::size_of::<WriteEvent>();

#[derive(Debug, Error)]
#[error("ring record has {actual} bytes, expected {expected}")]
pub struct DecodeError {
    pub actual: usize,
    pub expected: usize,
}

/// Decode one raw ring record. Rejects records whose length is not exactly
/// one `WriteEvent`.
pub fn decode(bytes: &[u8]) -> Result<WriteEvent, DecodeError> {
    if bytes.len() != EVENT_SIZE {
        return Err(DecodeError {
            actual: bytes.len(),
            expected: EVENT_SIZE,
        });
    }
    // Safety: length verified above and WriteEvent is a repr(C) Pod type.
    Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const WriteEvent) })
}

/// Task name with trailing NUL padding stripped.
pub fn comm_str(ev: &WriteEvent) -> Cow<'_, str> {
    String::from_utf8_lossy(ev.comm_bytes())
}

/// Captured payload with trailing newline characters stripped.
pub fn data_str(ev: &WriteEvent) -> Cow<'_, str> {
    let mut payload = ev.payload();
    while let Some((&last, rest)) = payload.split_last() {
        if last == b'\n' || last == b'\r' {
            payload = rest;
        } else {
            break;
        }
    }
    String::from_utf8_lossy(payload)
}

#[derive(Serialize)]
struct EventLine<'a> {
    timestamp: u64,
    pid: u32,
    tid: u32,
    comm: &'a str,
    fd: u32,
    count: u64,
    data: &'a str,
}

/// Render one event as the JSON line written to stdout and the file sink.
pub fn to_json_line(ev: &WriteEvent) -> String {
    let comm = comm_str(ev);
    let data = data_str(ev);
    let line = EventLine {
        timestamp: ev.timestamp,
        pid: ev.pid,
        tid: ev.tid,
        comm: &comm,
        fd: ev.fd,
        count: ev.count,
        data: &data,
    };
    serde_json::to_string(&line).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use write_tracer_common::{COMM_LEN, MAX_DATA_SIZE};

    /// Build a wire record the way the kernel does: little-endian fields at
    /// their fixed offsets.
    fn wire_record(timestamp: u64, count: u64, pid: u32, tid: u32, fd: u32, comm: &[u8], data: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; EVENT_SIZE];
        buf[0..8].copy_from_slice(&timestamp.to_le_bytes());
        buf[8..16].copy_from_slice(&count.to_le_bytes());
        buf[16..20].copy_from_slice(&pid.to_le_bytes());
        buf[20..24].copy_from_slice(&tid.to_le_bytes());
        buf[24..28].copy_from_slice(&fd.to_le_bytes());
        buf[32..32 + comm.len()].copy_from_slice(comm);
        buf[48..48 + data.len()].copy_from_slice(data);
        buf
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = decode(&[0u8; 303]).unwrap_err();
        assert_eq!(err.actual, 303);
        assert_eq!(err.expected, 304);

        assert!(decode(&[0u8; 305]).is_err());
        assert!(decode(&[0u8; 304]).is_ok());
    }

    #[test]
    fn decode_recovers_wire_fields() {
        let record = wire_record(123_456_789, 6, 4242, 4243, 1, b"cat\0", b"hello\n");
        let ev = decode(&record).unwrap();

        assert_eq!(ev.timestamp, 123_456_789);
        assert_eq!(ev.count, 6);
        assert_eq!(ev.pid, 4242);
        assert_eq!(ev.tid, 4243);
        assert_eq!(ev.fd, 1);
        assert_eq!(comm_str(&ev), "cat");
        assert_eq!(data_str(&ev), "hello");
    }

    #[test]
    fn data_is_bounded_by_capture_size() {
        // An 8 KiB write carries only the 256-byte prefix.
        let data = [b'a'; MAX_DATA_SIZE];
        let record = wire_record(1, 8192, 1, 1, 3, b"dd\0", &data);
        let ev = decode(&record).unwrap();

        assert_eq!(ev.count, 8192);
        assert_eq!(ev.payload().len(), MAX_DATA_SIZE);
        assert_eq!(data_str(&ev).len(), MAX_DATA_SIZE);
    }

    #[test]
    fn trailing_newlines_are_trimmed() {
        let record = wire_record(1, 7, 1, 1, 2, b"sh\0", b"abc\r\n\r\n");
        let ev = decode(&record).unwrap();
        assert_eq!(data_str(&ev), "abc");

        // Interior newlines survive.
        let record = wire_record(1, 7, 1, 1, 2, b"sh\0", b"a\nb\nc\n\n");
        let ev = decode(&record).unwrap();
        assert_eq!(data_str(&ev), "a\nb\nc");
    }

    #[test]
    fn non_utf8_payload_never_panics() {
        let record = wire_record(1, 4, 1, 1, 1, b"x\0", &[0xff, 0xfe, 0x80, 0x00]);
        let ev = decode(&record).unwrap();
        let line = to_json_line(&ev);
        assert!(!line.is_empty());
        assert!(serde_json::from_str::<serde_json::Value>(&line).is_ok());
    }

    #[test]
    fn json_line_round_trips_numeric_fields() {
        let record = wire_record(987_654_321, 6, 10, 11, 1, b"probe\0", b"hello\n");
        let ev = decode(&record).unwrap();
        let line = to_json_line(&ev);

        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["timestamp"].as_u64(), Some(987_654_321));
        assert_eq!(v["pid"].as_u64(), Some(10));
        assert_eq!(v["tid"].as_u64(), Some(11));
        assert_eq!(v["fd"].as_u64(), Some(1));
        assert_eq!(v["count"].as_u64(), Some(6));
        assert_eq!(v["comm"].as_str(), Some("probe"));
        assert_eq!(v["data"].as_str(), Some("hello"));
    }

    #[test]
    fn comm_uses_full_width_when_unterminated() {
        let comm = [b'y'; COMM_LEN];
        let record = wire_record(1, 0, 1, 1, 1, &comm, b"");
        let ev = decode(&record).unwrap();
        assert_eq!(comm_str(&ev).len(), COMM_LEN);
    }
}
