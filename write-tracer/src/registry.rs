//! Userspace registry of tracked parent processes.
//!
//! The kernel's fork/exit hooks keep the TID set fresh per lineage, but they
//! cannot notice that a registered parent died while none of its threads were
//! writing. The registry is the metadata side: which parents the operator
//! asked to trace, which threads were enrolled for each, and a periodic
//! liveness sweep that evicts dead parents and their TIDs.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use aya::maps::MapData;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// The kernel tracked-TID set, seen from userspace.
///
/// The production implementation is the eBPF hash map; tests substitute an
/// in-memory table.
pub trait TidTable: Send + Sync {
    fn insert(&mut self, tid: u32) -> anyhow::Result<()>;
    fn remove(&mut self, tid: u32) -> anyhow::Result<()>;
    /// Number of TIDs currently in the table.
    fn count(&self) -> usize;
}

impl TidTable for aya::maps::HashMap<MapData, u32, u8> {
    fn insert(&mut self, tid: u32) -> anyhow::Result<()> {
        aya::maps::HashMap::insert(self, tid, 1u8, 0).map_err(anyhow::Error::from)
    }

    fn remove(&mut self, tid: u32) -> anyhow::Result<()> {
        aya::maps::HashMap::remove(self, &tid).map_err(anyhow::Error::from)
    }

    fn count(&self) -> usize {
        self.keys().filter(|k| k.is_ok()).count()
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("PID {0} is already registered")]
    AlreadyRegistered(u32),
    #[error("PID {0} is not registered")]
    NotRegistered(u32),
    #[error("process {pid} not found: {source}")]
    ProcessNotFound { pid: u32, source: io::Error },
    #[error("kernel map update for TID {tid} failed: {source}")]
    KernelMap { tid: u32, source: anyhow::Error },
}

/// One registered parent and the threads enrolled for it.
#[derive(Debug, Clone)]
pub struct TrackedProcess {
    pub parent_pid: u32,
    pub thread_ids: HashSet<u32>,
    pub registered_at: DateTime<Utc>,
    pub registered_instant: Instant,
}

struct Inner {
    processes: HashMap<u32, TrackedProcess>,
    tids: Box<dyn TidTable>,
}

/// Thread-safe registry of tracked parent PIDs.
///
/// A single reader/writer lock guards both the parent map and the kernel TID
/// table handle; every critical section is short and never blocks on I/O
/// other than `/proc` reads.
pub struct PidRegistry {
    inner: RwLock<Inner>,
    check_interval: Duration,
}

impl PidRegistry {
    pub fn new(tids: Box<dyn TidTable>, check_interval: Duration) -> Self {
        let check_interval = if check_interval.is_zero() {
            DEFAULT_CHECK_INTERVAL
        } else {
            check_interval
        };
        Self {
            inner: RwLock::new(Inner {
                processes: HashMap::new(),
                tids,
            }),
            check_interval,
        }
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Register a parent PID: snapshot `/proc/<pid>/task` and enroll every
    /// thread in the kernel map. On any enrollment failure the TIDs inserted
    /// by this call are rolled back. Returns the number of threads enrolled.
    pub fn register(&self, pid: u32) -> Result<usize, RegistryError> {
        let mut inner = self.write_lock();

        if inner.processes.contains_key(&pid) {
            return Err(RegistryError::AlreadyRegistered(pid));
        }

        let thread_ids =
            read_threads(pid).map_err(|source| RegistryError::ProcessNotFound { pid, source })?;

        let mut inserted = Vec::with_capacity(thread_ids.len());
        for &tid in &thread_ids {
            if let Err(source) = inner.tids.insert(tid) {
                for &done in &inserted {
                    if let Err(e) = inner.tids.remove(done) {
                        debug!(tid = done, error = %e, "rollback delete failed");
                    }
                }
                return Err(RegistryError::KernelMap { tid, source });
            }
            inserted.push(tid);
        }

        let threads = thread_ids.len();
        inner.processes.insert(
            pid,
            TrackedProcess {
                parent_pid: pid,
                thread_ids,
                registered_at: Utc::now(),
                registered_instant: Instant::now(),
            },
        );

        info!(pid, threads, "registered PID for tracking");
        Ok(threads)
    }

    /// Unregister a parent PID and delete its threads from the kernel map.
    /// Individual delete failures are logged, not fatal.
    pub fn unregister(&self, pid: u32) -> Result<(), RegistryError> {
        let mut inner = self.write_lock();

        let proc = inner
            .processes
            .remove(&pid)
            .ok_or(RegistryError::NotRegistered(pid))?;

        for &tid in &proc.thread_ids {
            if let Err(e) = inner.tids.remove(tid) {
                warn!(tid, error = %e, "failed to delete TID from kernel map");
            }
        }

        info!(pid, "unregistered PID from tracking");
        Ok(())
    }

    /// A consistent snapshot of all tracked processes.
    pub fn list(&self) -> Vec<TrackedProcess> {
        self.read_lock().processes.values().cloned().collect()
    }

    pub fn is_registered(&self, pid: u32) -> bool {
        self.read_lock().processes.contains_key(&pid)
    }

    /// One tracked process, by parent PID.
    pub fn get(&self, pid: u32) -> Option<TrackedProcess> {
        self.read_lock().processes.get(&pid).cloned()
    }

    /// Re-read `/proc/<pid>/task` and enroll threads that appeared since
    /// registration. Per-TID insert failures are logged and skipped. Returns
    /// the number of newly enrolled threads.
    pub fn refresh_threads(&self, pid: u32) -> Result<usize, RegistryError> {
        let mut inner = self.write_lock();
        Self::refresh_locked(&mut inner, pid)
    }

    fn refresh_locked(inner: &mut Inner, pid: u32) -> Result<usize, RegistryError> {
        if !inner.processes.contains_key(&pid) {
            return Err(RegistryError::NotRegistered(pid));
        }

        let current =
            read_threads(pid).map_err(|source| RegistryError::ProcessNotFound { pid, source })?;

        let Inner { processes, tids } = inner;
        let proc = match processes.get_mut(&pid) {
            Some(proc) => proc,
            None => return Err(RegistryError::NotRegistered(pid)),
        };

        let mut added = 0;
        for &tid in &current {
            if proc.thread_ids.contains(&tid) {
                continue;
            }
            match tids.insert(tid) {
                Ok(()) => {
                    proc.thread_ids.insert(tid);
                    added += 1;
                }
                Err(e) => warn!(tid, error = %e, "failed to add new TID to kernel map"),
            }
        }

        if added > 0 {
            debug!(pid, added, "picked up new threads");
        }
        Ok(added)
    }

    /// One liveness pass: evict parents whose `/proc/<pid>` is gone (deleting
    /// their TIDs from the kernel map) and refresh the thread snapshot of the
    /// ones still alive.
    pub fn sweep(&self) {
        let mut inner = self.write_lock();

        let pids: Vec<u32> = inner.processes.keys().copied().collect();
        for pid in pids {
            if process_exists(pid) {
                // Catches threads cloned before the fork hook enrolled them.
                if let Err(e) = Self::refresh_locked(&mut inner, pid) {
                    debug!(pid, error = %e, "thread refresh failed");
                }
                continue;
            }

            let Some(proc) = inner.processes.remove(&pid) else {
                continue;
            };
            for &tid in &proc.thread_ids {
                if let Err(e) = inner.tids.remove(tid) {
                    debug!(tid, error = %e, "failed to delete TID of dead process");
                }
            }
            info!(
                pid,
                tracked_for = ?proc.registered_instant.elapsed(),
                "auto-removed terminated process"
            );
        }
    }

    /// Size of the kernel TID set, for the tracked-threads gauge.
    pub fn tracked_thread_count(&self) -> usize {
        self.read_lock().tids.count()
    }

    /// Periodic liveness monitor. Runs until cancelled.
    pub async fn run_liveness_monitor(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.check_interval);
        // The immediate first tick would race the startup registration.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(),
                _ = shutdown.cancelled() => return,
            }
        }
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn insert_for_test(&self, pid: u32, thread_ids: HashSet<u32>) {
        let mut inner = self.write_lock();
        for &tid in &thread_ids {
            inner.tids.insert(tid).unwrap();
        }
        inner.processes.insert(
            pid,
            TrackedProcess {
                parent_pid: pid,
                thread_ids,
                registered_at: Utc::now(),
                registered_instant: Instant::now(),
            },
        );
    }
}

fn process_exists(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

fn read_threads(pid: u32) -> io::Result<HashSet<u32>> {
    let mut tids = HashSet::new();
    for entry in std::fs::read_dir(format!("/proc/{pid}/task"))? {
        let entry = entry?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<u32>() {
            tids.insert(tid);
        }
    }
    Ok(tids)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::TidTable;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// Shared in-memory stand-in for the kernel TID map.
    #[derive(Clone, Default)]
    pub struct FakeTidTable {
        pub tids: Arc<Mutex<HashSet<u32>>>,
        /// When set, the n-th insert after construction fails.
        pub fail_after: Arc<Mutex<Option<usize>>>,
    }

    impl FakeTidTable {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn contains(&self, tid: u32) -> bool {
            self.tids.lock().unwrap().contains(&tid)
        }

        pub fn len(&self) -> usize {
            self.tids.lock().unwrap().len()
        }
    }

    impl TidTable for FakeTidTable {
        fn insert(&mut self, tid: u32) -> anyhow::Result<()> {
            let mut fail_after = self.fail_after.lock().unwrap();
            if let Some(remaining) = fail_after.as_mut() {
                if *remaining == 0 {
                    anyhow::bail!("map is full");
                }
                *remaining -= 1;
            }
            self.tids.lock().unwrap().insert(tid);
            Ok(())
        }

        fn remove(&mut self, tid: u32) -> anyhow::Result<()> {
            if self.tids.lock().unwrap().remove(&tid) {
                Ok(())
            } else {
                anyhow::bail!("no such TID {tid}")
            }
        }

        fn count(&self) -> usize {
            self.tids.lock().unwrap().len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::FakeTidTable;
    use super::*;

    fn registry_with_fake() -> (PidRegistry, FakeTidTable) {
        let fake = FakeTidTable::new();
        let registry = PidRegistry::new(Box::new(fake.clone()), Duration::from_secs(1));
        (registry, fake)
    }

    fn self_pid() -> u32 {
        std::process::id()
    }

    #[test]
    fn register_enrolls_current_threads() {
        let (registry, fake) = registry_with_fake();

        let threads = registry.register(self_pid()).unwrap();
        assert!(threads >= 1);
        assert_eq!(fake.len(), threads);
        assert!(registry.is_registered(self_pid()));

        let procs = registry.list();
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].parent_pid, self_pid());
        assert_eq!(procs[0].thread_ids.len(), threads);
    }

    #[test]
    fn register_twice_fails() {
        let (registry, _fake) = registry_with_fake();
        registry.register(self_pid()).unwrap();

        let err = registry.register(self_pid()).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(p) if p == self_pid()));
    }

    #[test]
    fn register_unknown_pid_fails() {
        let (registry, fake) = registry_with_fake();

        let err = registry.register(u32::MAX).unwrap_err();
        assert!(matches!(err, RegistryError::ProcessNotFound { pid, .. } if pid == u32::MAX));
        assert_eq!(fake.len(), 0);
    }

    #[test]
    fn register_rolls_back_on_map_failure() {
        let (registry, fake) = registry_with_fake();

        // Pre-existing entry from another lineage must survive the rollback.
        fake.tids.lock().unwrap().insert(999_999);
        *fake.fail_after.lock().unwrap() = Some(0);

        let err = registry.register(self_pid()).unwrap_err();
        assert!(matches!(err, RegistryError::KernelMap { .. }));
        assert!(!registry.is_registered(self_pid()));
        assert_eq!(fake.len(), 1);
        assert!(fake.contains(999_999));
    }

    #[test]
    fn unregister_removes_tids() {
        let (registry, fake) = registry_with_fake();
        registry.register(self_pid()).unwrap();
        assert!(fake.len() >= 1);

        registry.unregister(self_pid()).unwrap();
        assert_eq!(fake.len(), 0);
        assert!(!registry.is_registered(self_pid()));

        let err = registry.unregister(self_pid()).unwrap_err();
        assert!(matches!(err, RegistryError::NotRegistered(_)));
    }

    #[test]
    fn register_after_unregister_behaves_like_first_register() {
        let (registry, fake) = registry_with_fake();

        let first = registry.register(self_pid()).unwrap();
        registry.unregister(self_pid()).unwrap();
        let second = registry.register(self_pid()).unwrap();

        assert_eq!(first, second);
        assert_eq!(fake.len(), second);
    }

    #[test]
    fn refresh_requires_registration() {
        let (registry, _fake) = registry_with_fake();
        let err = registry.refresh_threads(self_pid()).unwrap_err();
        assert!(matches!(err, RegistryError::NotRegistered(_)));
    }

    #[test]
    fn refresh_enrolls_missing_threads() {
        let (registry, fake) = registry_with_fake();
        registry.register(self_pid()).unwrap();

        // Nothing new right after a register.
        assert_eq!(registry.refresh_threads(self_pid()).unwrap(), 0);

        // Drop the current thread's TID behind the registry's back; refresh
        // restores it. (This thread is guaranteed to stay in /proc/self/task.)
        let victim = unsafe { libc::gettid() } as u32;
        fake.tids.lock().unwrap().remove(&victim);
        {
            let mut inner = registry.write_lock();
            inner.processes.get_mut(&self_pid()).unwrap().thread_ids.remove(&victim);
        }
        assert_eq!(registry.refresh_threads(self_pid()).unwrap(), 1);
        assert!(fake.contains(victim));
    }

    #[test]
    fn sweep_evicts_dead_parents() {
        let (registry, fake) = registry_with_fake();

        // No such process: /proc/<u32::MAX> cannot exist.
        registry.insert_for_test(u32::MAX, [111_111, 222_222].into_iter().collect());
        registry.register(self_pid()).unwrap();
        let live_count = fake.len() - 2;

        registry.sweep();

        assert!(!registry.is_registered(u32::MAX));
        assert!(registry.is_registered(self_pid()));
        assert!(!fake.contains(111_111));
        assert!(!fake.contains(222_222));
        assert!(fake.len() >= live_count);
    }

    #[test]
    fn tracked_thread_count_reflects_table() {
        let (registry, fake) = registry_with_fake();
        assert_eq!(registry.tracked_thread_count(), 0);

        registry.register(self_pid()).unwrap();
        assert_eq!(registry.tracked_thread_count(), fake.len());
    }
}
