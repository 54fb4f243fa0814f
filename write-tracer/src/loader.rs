//! Loads the compiled eBPF object, attaches the tracepoints, and seeds the
//! kernel maps.
//!
//! Any failure here aborts startup. Attach handles live inside the returned
//! [`LoadedTracer`]; dropping it detaches every probe, including on the error
//! paths of a partially completed startup.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use aya::maps::{Array, HashMap as TidHashMap, MapData, RingBuf};
use aya::programs::TracePoint;
use aya::Ebpf;
use tracing::{debug, info};

use crate::config::Config;
use write_tracer_common::{CONFIG_MAP, EVENTS_MAP, TRACKED_TIDS_MAP};

/// Paths searched for the compiled probe object, produced by
/// `cargo xtask build-ebpf`.
const EBPF_OBJECT_PATHS: &[&str] = &[
    "./target/bpf/write_tracer.o",
    "/usr/share/write-tracer/write_tracer.o",
    "/usr/local/share/write-tracer/write_tracer.o",
];

/// Handle to the loaded and attached probes.
///
/// Owns the underlying [`Ebpf`] object: the tracepoints stay attached exactly
/// as long as this value lives.
pub struct LoadedTracer {
    ebpf: Ebpf,
}

impl LoadedTracer {
    /// Take ownership of the event ring for the reader task.
    pub fn take_event_ring(&mut self) -> Result<RingBuf<MapData>> {
        let map = self
            .ebpf
            .take_map(EVENTS_MAP)
            .ok_or_else(|| anyhow!("map {EVENTS_MAP} not found in eBPF object"))?;
        RingBuf::try_from(map).context("open event ring")
    }

    /// Take ownership of the tracked-TID map for the registry.
    pub fn take_tid_table(&mut self) -> Result<TidHashMap<MapData, u32, u8>> {
        let map = self
            .ebpf
            .take_map(TRACKED_TIDS_MAP)
            .ok_or_else(|| anyhow!("map {TRACKED_TIDS_MAP} not found in eBPF object"))?;
        TidHashMap::try_from(map).context("open tracked-TID map")
    }
}

/// Load the probe object, push the kernel config, seed the TID map from the
/// CLI PID, and attach all three tracepoints.
pub fn load(config: &Config) -> Result<LoadedTracer> {
    remove_memlock_limit();

    let object = find_object()?;
    info!(object = %object.display(), "loading eBPF object");
    let mut ebpf = Ebpf::load_file(&object)
        .with_context(|| format!("load eBPF object {}", object.display()))?;

    write_kernel_config(&mut ebpf, config)?;

    if config.target_pid != 0 {
        let count = seed_tracked_tids(&mut ebpf, config.target_pid)?;
        info!(
            target_pid = config.target_pid,
            threads_found = count,
            "initialized tracking"
        );
    }

    attach_tracepoint(&mut ebpf, "sys_enter_write", "syscalls", "sys_enter_write")?;
    attach_tracepoint(&mut ebpf, "sched_process_fork", "sched", "sched_process_fork")?;
    attach_tracepoint(&mut ebpf, "sched_process_exit", "sched", "sched_process_exit")?;

    Ok(LoadedTracer { ebpf })
}

/// Bump the memlock rlimit. Needed for kernels that predate memcg-based
/// BPF memory accounting.
fn remove_memlock_limit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!(ret, "removing the locked-memory limit failed");
    }
}

fn find_object() -> Result<PathBuf> {
    for path in EBPF_OBJECT_PATHS {
        if Path::new(path).exists() {
            return Ok(PathBuf::from(path));
        }
    }
    Err(anyhow!(
        "no eBPF object found; build it with `cargo xtask build-ebpf`. Searched:\n  {}",
        EBPF_OBJECT_PATHS.join("\n  ")
    ))
}

fn write_kernel_config(ebpf: &mut Ebpf, config: &Config) -> Result<()> {
    let map = ebpf
        .map_mut(CONFIG_MAP)
        .ok_or_else(|| anyhow!("map {CONFIG_MAP} not found in eBPF object"))?;
    let mut array: Array<_, write_tracer_common::TraceConfig> =
        Array::try_from(map).context("open config map")?;
    array
        .set(0, config.kernel_config(), 0)
        .context("write kernel config")?;
    Ok(())
}

fn seed_tracked_tids(ebpf: &mut Ebpf, target_pid: u32) -> Result<usize> {
    let map = ebpf
        .map_mut(TRACKED_TIDS_MAP)
        .ok_or_else(|| anyhow!("map {TRACKED_TIDS_MAP} not found in eBPF object"))?;
    let mut tids: TidHashMap<_, u32, u8> =
        TidHashMap::try_from(map).context("open tracked-TID map")?;

    let entries = std::fs::read_dir(format!("/proc/{target_pid}/task"))
        .with_context(|| format!("read threads of PID {target_pid}"))?;

    let mut count = 0;
    for entry in entries {
        let entry = entry.context("read /proc task entry")?;
        let Ok(tid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        tids.insert(tid, 1u8, 0)
            .with_context(|| format!("insert TID {tid} into tracked-TID map"))?;
        count += 1;
    }
    Ok(count)
}

fn attach_tracepoint(ebpf: &mut Ebpf, program: &str, category: &str, event: &str) -> Result<()> {
    let prog: &mut TracePoint = ebpf
        .program_mut(program)
        .ok_or_else(|| anyhow!("program {program} not found in eBPF object"))?
        .try_into()
        .with_context(|| format!("program {program} is not a tracepoint"))?;
    prog.load()
        .with_context(|| format!("load program {program}"))?;
    prog.attach(category, event)
        .with_context(|| format!("attach {category}:{event}"))?;
    debug!(program, tracepoint = format!("{category}:{event}"), "attached");
    Ok(())
}
