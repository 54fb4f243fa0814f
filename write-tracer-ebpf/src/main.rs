//! eBPF programs for the write tracer.
//!
//! This crate compiles to BPF bytecode and runs in the Linux kernel. It
//! attaches to three tracepoints:
//! - `syscalls:sys_enter_write` - capture write calls from tracked threads
//! - `sched:sched_process_fork` - enroll children of tracked threads
//! - `sched:sched_process_exit` - evict threads that terminate
//!
//! Captured events are emitted to userspace through a ring buffer. All
//! filtering happens here: two map lookups plus a linear FD scan bounded by
//! MAX_FDS, so an untracked thread pays almost nothing.

#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read_user_buf},
    macros::{map, tracepoint},
    maps::{Array, HashMap, RingBuf},
    programs::TracePointContext,
};
use write_tracer_common::{TraceConfig, WriteEvent, EVENT_RING_BYTES, MAX_DATA_SIZE, MAX_FDS, MAX_TRACKED_TIDS};

/// Filter configuration, written once by the loader into slot 0.
#[map]
static CONFIG: Array<TraceConfig> = Array::with_max_entries(1, 0);

/// Set of thread ids currently being traced. Written by userspace (registry
/// operations) and by the fork/exit hooks below; the value slot is unused.
#[map]
static TRACKED_TIDS: HashMap<u32, u8> = HashMap::with_max_entries(MAX_TRACKED_TIDS, 0);

/// Event ring to userspace.
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(EVENT_RING_BYTES, 0);

/// Linear scan of the FD filter. The loop bound must be visible to the
/// verifier, so it runs to MAX_FDS and breaks on num_fds.
#[inline(always)]
fn is_target_fd(cfg: &TraceConfig, fd: u32) -> bool {
    for i in 0..MAX_FDS {
        if i as u32 >= cfg.num_fds {
            break;
        }
        if cfg.target_fds[i] == fd {
            return true;
        }
    }
    false
}

/// Tracepoint handler for syscalls:sys_enter_write.
///
/// Filters on thread id membership and optionally on file descriptor, then
/// emits one fixed-size event per call. If the ring is full the event is
/// dropped; the probe never blocks.
#[tracepoint]
pub fn sys_enter_write(ctx: TracePointContext) -> u32 {
    match unsafe { try_sys_enter_write(&ctx) } {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

#[inline(always)]
unsafe fn try_sys_enter_write(ctx: &TracePointContext) -> Result<(), i64> {
    let pid_tgid = bpf_get_current_pid_tgid();
    let pid = (pid_tgid >> 32) as u32;
    let tid = pid_tgid as u32;

    // Membership is checked against the TID, not the TGID: a freshly cloned
    // thread is only seen here once the fork hook has enrolled it.
    if TRACKED_TIDS.get(&tid).is_none() {
        return Ok(());
    }

    let cfg = match CONFIG.get(0) {
        Some(cfg) => cfg,
        None => return Ok(()),
    };

    // syscalls:sys_enter_write format
    // (/sys/kernel/debug/tracing/events/syscalls/sys_enter_write/format):
    //   field:int __syscall_nr;    offset:8;  size:4; signed:1;
    //   field:unsigned int fd;     offset:16; size:8; signed:0;
    //   field:const char * buf;    offset:24; size:8; signed:0;
    //   field:size_t count;        offset:32; size:8; signed:0;
    let fd: u64 = ctx.read_at(16).map_err(|e| e as i64)?;
    let buf: u64 = ctx.read_at(24).map_err(|e| e as i64)?;
    let count: u64 = ctx.read_at(32).map_err(|e| e as i64)?;

    let fd = fd as u32;
    if cfg.num_fds > 0 && !is_target_fd(cfg, fd) {
        return Ok(());
    }

    // Reservation failure is the in-kernel backpressure point: the event is
    // dropped and the syscall proceeds untouched.
    let mut entry = match EVENTS.reserve::<WriteEvent>(0) {
        Some(entry) => entry,
        None => return Ok(()),
    };
    let event = match entry.as_mut_ptr().as_mut() {
        Some(event) => event,
        None => {
            entry.discard(0);
            return Ok(());
        }
    };

    event.timestamp = bpf_ktime_get_ns();
    event.count = count;
    event.pid = pid;
    event.tid = tid;
    event.fd = fd;
    event._padding = 0;

    event.comm = bpf_get_current_comm().unwrap_or([0u8; 16]);

    // Best-effort capture of the payload prefix. A failed user-copy leaves
    // the remainder of `data` undefined but the event is still submitted.
    let data_len = if count < MAX_DATA_SIZE as u64 {
        count as usize
    } else {
        MAX_DATA_SIZE
    };
    if data_len > 0 {
        let _ = bpf_probe_read_user_buf(buf as *const u8, &mut event.data[..data_len]);
    }

    entry.submit(0);
    Ok(())
}

/// Tracepoint handler for sched:sched_process_fork.
///
/// If the parent thread is tracked, the child inherits tracing. This is what
/// lets descendants of a registered root be followed without any userspace
/// involvement on the hot path.
#[tracepoint]
pub fn sched_process_fork(ctx: TracePointContext) -> u32 {
    match unsafe { try_sched_process_fork(&ctx) } {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

#[inline(always)]
unsafe fn try_sched_process_fork(ctx: &TracePointContext) -> Result<(), i64> {
    // sched:sched_process_fork format:
    //   field:char parent_comm[16]; offset:8;  size:16; signed:0;
    //   field:pid_t parent_pid;     offset:24; size:4;  signed:1;
    //   field:char child_comm[16];  offset:28; size:16; signed:0;
    //   field:pid_t child_pid;      offset:44; size:4;  signed:1;
    //
    // Both pid fields are task->pid, i.e. thread ids.
    let parent_tid: i32 = ctx.read_at(24).map_err(|e| e as i64)?;
    let child_tid: i32 = ctx.read_at(44).map_err(|e| e as i64)?;

    if TRACKED_TIDS.get(&(parent_tid as u32)).is_some() {
        let _ = TRACKED_TIDS.insert(&(child_tid as u32), &1u8, 0);
    }

    Ok(())
}

/// Tracepoint handler for sched:sched_process_exit.
///
/// Evicts the exiting thread id so the set stays bounded even for workloads
/// that churn through short-lived threads.
#[tracepoint]
pub fn sched_process_exit(ctx: TracePointContext) -> u32 {
    match unsafe { try_sched_process_exit(&ctx) } {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

#[inline(always)]
unsafe fn try_sched_process_exit(ctx: &TracePointContext) -> Result<(), i64> {
    // sched:sched_process_exit format:
    //   field:char comm[16]; offset:8;  size:16; signed:0;
    //   field:pid_t pid;     offset:24; size:4;  signed:1;
    //   field:int prio;      offset:28; size:4;  signed:1;
    let tid: i32 = ctx.read_at(24).map_err(|e| e as i64)?;

    let _ = TRACKED_TIDS.remove(&(tid as u32));

    Ok(())
}

/// Panic handler required for no_std.
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
