//! write-tracer - per-process write(2) visibility via eBPF.
//!
//! An in-kernel probe filters write syscalls against a set of tracked thread
//! ids and streams bounded event records through a ring buffer; this library
//! provides the userspace side: loading and attaching the probes, the PID
//! registry with lineage-aware liveness, the event pipeline, and the sinks
//! (stdout, rotating file, Loki push).

pub mod api;
pub mod config;
pub mod event;
pub mod loader;
pub mod metrics;
pub mod output;
pub mod pipeline;
pub mod registry;

pub use config::{Cli, Config};
pub use registry::PidRegistry;
