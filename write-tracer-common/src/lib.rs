//! Shared types for the write-tracer eBPF programs and userspace.
//!
//! These types cross the kernel/user boundary, so every one of them is
//! `#[repr(C)]` with explicit padding and fixed-size arrays. The wire layout
//! must match byte-for-byte on both sides; the tests at the bottom pin it
//! down.

#![no_std]

/// Maximum length for process names (comm field in kernel).
/// This matches the kernel's TASK_COMM_LEN.
pub const COMM_LEN: usize = 16;

/// Maximum number of bytes captured from the write buffer per event.
pub const MAX_DATA_SIZE: usize = 256;

/// Maximum number of file descriptors the in-kernel filter can hold.
pub const MAX_FDS: usize = 64;

/// Maximum number of threads tracked simultaneously. Sized for large
/// parallel applications (e.g. MPI jobs with 10k ranks).
pub const MAX_TRACKED_TIDS: u32 = 10_240;

/// Ring buffer size in bytes. 256KB holds roughly 800 in-flight events at
/// 304 bytes each.
pub const EVENT_RING_BYTES: u32 = 256 * 1024;

/// Map names as they appear in the compiled BPF object.
pub const CONFIG_MAP: &str = "CONFIG";
pub const TRACKED_TIDS_MAP: &str = "TRACKED_TIDS";
pub const EVENTS_MAP: &str = "EVENTS";

/// Filter configuration pushed from userspace into slot 0 of the config
/// array map. `target_fds` is only consulted when `num_fds > 0`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TraceConfig {
    /// Root PID named on the command line; 0 when registration is dynamic.
    pub target_pid: u32,
    /// Number of valid entries in `target_fds`. 0 means "all FDs".
    pub num_fds: u32,
    /// File descriptors to capture, in CLI order.
    pub target_fds: [u32; MAX_FDS],
}

impl TraceConfig {
    /// Create a zeroed config (no PID, no FD filter).
    pub const fn zeroed() -> Self {
        Self {
            target_pid: 0,
            num_fds: 0,
            target_fds: [0; MAX_FDS],
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// One captured `write(2)` call.
///
/// Emitted by the `sys_enter_write` probe through the event ring. The record
/// is always 304 bytes regardless of `count`; `data` holds the first
/// `min(count, MAX_DATA_SIZE)` bytes of the user buffer and the remainder is
/// undefined.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct WriteEvent {
    /// Kernel monotonic timestamp in nanoseconds (bpf_ktime_get_ns).
    pub timestamp: u64,
    /// Byte count the syscall was invoked with (may exceed MAX_DATA_SIZE).
    pub count: u64,
    /// Thread-group id (what userspace calls the process id).
    pub pid: u32,
    /// Thread id (task->pid).
    pub tid: u32,
    /// File descriptor written to.
    pub fd: u32,
    /// Explicit padding for 8-byte alignment of `comm`. Must be zero.
    pub _padding: u32,
    /// Task name, NUL-padded.
    pub comm: [u8; COMM_LEN],
    /// Captured prefix of the write buffer.
    pub data: [u8; MAX_DATA_SIZE],
}

impl WriteEvent {
    /// Create a zeroed event.
    pub const fn zeroed() -> Self {
        Self {
            timestamp: 0,
            count: 0,
            pid: 0,
            tid: 0,
            fd: 0,
            _padding: 0,
            comm: [0; COMM_LEN],
            data: [0; MAX_DATA_SIZE],
        }
    }

    /// Task name as a byte slice, trailing NULs stripped.
    pub fn comm_bytes(&self) -> &[u8] {
        let end = self.comm.iter().position(|&b| b == 0).unwrap_or(COMM_LEN);
        &self.comm[..end]
    }

    /// The valid portion of the captured payload:
    /// the first `min(count, MAX_DATA_SIZE)` bytes.
    pub fn payload(&self) -> &[u8] {
        let len = if self.count < MAX_DATA_SIZE as u64 {
            self.count as usize
        } else {
            MAX_DATA_SIZE
        };
        &self.data[..len]
    }
}

impl Default for WriteEvent {
    fn default() -> Self {
        Self::zeroed()
    }
}

// The types are repr(C) with only primitive fields and fixed-size arrays,
// making them safe to transmute from raw bytes. Only compiled for userspace.

#[cfg(feature = "user")]
unsafe impl aya::Pod for WriteEvent {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for TraceConfig {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{align_of, offset_of, size_of};

    #[test]
    fn write_event_wire_layout() {
        // The userspace decoder rejects anything that is not exactly this.
        assert_eq!(size_of::<WriteEvent>(), 304);
        assert_eq!(align_of::<WriteEvent>(), 8);

        assert_eq!(offset_of!(WriteEvent, timestamp), 0);
        assert_eq!(offset_of!(WriteEvent, count), 8);
        assert_eq!(offset_of!(WriteEvent, pid), 16);
        assert_eq!(offset_of!(WriteEvent, tid), 20);
        assert_eq!(offset_of!(WriteEvent, fd), 24);
        assert_eq!(offset_of!(WriteEvent, _padding), 28);
        assert_eq!(offset_of!(WriteEvent, comm), 32);
        assert_eq!(offset_of!(WriteEvent, data), 48);
    }

    #[test]
    fn trace_config_layout() {
        assert_eq!(size_of::<TraceConfig>(), 8 + 4 * MAX_FDS);
        assert_eq!(offset_of!(TraceConfig, num_fds), 4);
        assert_eq!(offset_of!(TraceConfig, target_fds), 8);
    }

    #[test]
    fn comm_bytes_stops_at_nul() {
        let mut ev = WriteEvent::zeroed();
        ev.comm[..4].copy_from_slice(b"bash");
        assert_eq!(ev.comm_bytes(), b"bash");

        ev.comm = [b'x'; COMM_LEN];
        assert_eq!(ev.comm_bytes().len(), COMM_LEN);
    }

    #[test]
    fn payload_is_bounded_by_count_and_capture_size() {
        let mut ev = WriteEvent::zeroed();
        ev.count = 6;
        ev.data[..6].copy_from_slice(b"hello\n");
        assert_eq!(ev.payload(), b"hello\n");

        // A large write still only exposes the captured prefix.
        ev.count = 8192;
        assert_eq!(ev.payload().len(), MAX_DATA_SIZE);
    }
}
