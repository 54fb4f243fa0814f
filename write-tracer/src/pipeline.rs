//! Ring consumption, bounded queueing, and sink fan-out.
//!
//! Events can be dropped at exactly two points: in the kernel when the ring
//! is full, and here when the bounded queue is full. Both are counted in the
//! logs and nowhere else; adding a retry path would unbound memory.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aya::maps::{MapData, RingBuf};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use write_tracer_common::WriteEvent;

use crate::event;
use crate::metrics;
use crate::output::{FileWriter, LokiClient};
use crate::registry::PidRegistry;

/// Capacity of the reader → dispatcher queue.
pub const QUEUE_CAPACITY: usize = 1024;

/// How long the dispatcher keeps draining queued events after cancellation.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Consume the kernel ring and feed the dispatcher queue. The send is
/// non-blocking: a full queue drops the event.
pub async fn read_ring(
    ring: RingBuf<MapData>,
    tx: mpsc::Sender<WriteEvent>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut ring = AsyncFd::new(ring).context("register event ring with the reactor")?;
    let mut dropped: u64 = 0;

    loop {
        tokio::select! {
            res = ring.readable_mut() => {
                let mut guard = res.context("wait for ring readability")?;
                let ring = guard.get_inner_mut();

                while let Some(record) = ring.next() {
                    let ev = match event::decode(&record) {
                        Ok(ev) => ev,
                        Err(e) => {
                            error!(error = %e, "event parse failed");
                            continue;
                        }
                    };

                    match tx.try_send(ev) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            dropped += 1;
                            warn!(dropped_total = dropped, "event queue full, dropping event");
                        }
                        Err(TrySendError::Closed(_)) => return Ok(()),
                    }
                }

                guard.clear_ready();
            }
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

/// Fans each event out to the configured sinks, preserving arrival order
/// within every sink. Only the Loki push leaves this task, as a detached
/// fire-and-forget job.
pub struct Dispatcher {
    rx: mpsc::Receiver<WriteEvent>,
    file: Option<FileWriter>,
    loki: Option<Arc<LokiClient>>,
    silence_stdout: bool,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        rx: mpsc::Receiver<WriteEvent>,
        file: Option<FileWriter>,
        loki: Option<Arc<LokiClient>>,
        silence_stdout: bool,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            rx,
            file,
            loki,
            silence_stdout,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(ev) => self.handle(&ev),
                    None => break,
                },
                // Cancellation is honored between events, never mid-write.
                _ = self.shutdown.cancelled() => {
                    self.drain().await;
                    break;
                }
            }
        }

        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.close() {
                warn!(error = %e, "closing output file failed");
            }
        }
    }

    fn handle(&mut self, ev: &WriteEvent) {
        metrics::WRITE_CALLS.inc();

        let line = event::to_json_line(ev);

        if !self.silence_stdout {
            println!("{line}");
        }

        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_line(&line) {
                warn!(error = %e, "file write failed");
            }
        }

        if let Some(loki) = &self.loki {
            let loki = Arc::clone(loki);
            let ev = *ev;
            tokio::spawn(async move {
                if let Err(e) = loki.push(&ev).await {
                    warn!(error = %e, "Loki push failed");
                }
            });
        }
    }

    async fn drain(&mut self) {
        let deadline = tokio::time::Instant::now() + DRAIN_DEADLINE;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(ev)) => self.handle(&ev),
                Ok(None) => break,
                Err(_) => {
                    warn!("drain deadline reached, discarding queued events");
                    break;
                }
            }
        }
    }
}

/// Periodically size the kernel TID set into the gauge and log the tracking
/// status.
pub async fn count_tracked(
    registry: Arc<PidRegistry>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let count = registry.tracked_thread_count();
                metrics::TRACKED_THREADS.set(count as i64);
                info!(threads_count = count, "current tracking status");
            }
            _ = shutdown.cancelled() => return,
        }
    }
}
