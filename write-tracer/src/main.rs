use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use write_tracer::config::{self, Cli, Config};
use write_tracer::output::{FileWriter, LokiClient};
use write_tracer::registry::PidRegistry;
use write_tracer::{api, loader, metrics, pipeline};

#[tokio::main]
async fn main() -> Result<()> {
    config::init_logging();

    let config = match Config::from_cli(Cli::parse()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    if config.metrics_port > 0 {
        tokio::spawn(metrics::start_server(config.metrics_port));
        info!(port = config.metrics_port, "metrics server started");
    }

    if config.target_fds.is_empty() {
        info!(pid = config.target_pid, file_descriptors = "all", "monitoring write calls");
    } else {
        info!(pid = config.target_pid, file_descriptors = ?config.target_fds, "monitoring write calls");
    }

    let mut tracer = loader::load(&config).context("failed to load eBPF")?;
    let ring = tracer.take_event_ring()?;
    let tid_table = tracer.take_tid_table()?;

    let registry = Arc::new(PidRegistry::new(
        Box::new(tid_table),
        config.tracking_interval,
    ));

    let shutdown = CancellationToken::new();

    // The loader already seeded the kernel map from the CLI PID; registering
    // it here re-inserts the same TIDs (idempotent) and puts the process
    // under liveness monitoring.
    if config.target_pid != 0 {
        if let Err(e) = registry.register(config.target_pid) {
            warn!(pid = config.target_pid, error = %e, "failed to register CLI PID with registry");
        }
    }

    tokio::spawn(Arc::clone(&registry).run_liveness_monitor(shutdown.clone()));

    if config.rest_port > 0 {
        tokio::spawn(api::serve(
            Arc::clone(&registry),
            config.rest_port,
            shutdown.clone(),
        ));
        info!(port = config.rest_port, "REST API server started");
    }

    tokio::spawn(pipeline::count_tracked(
        Arc::clone(&registry),
        config.tracking_interval,
        shutdown.clone(),
    ));

    let (tx, rx) = mpsc::channel(pipeline::QUEUE_CAPACITY);
    let reader = tokio::spawn(pipeline::read_ring(ring, tx, shutdown.clone()));

    let file = config
        .file_output
        .clone()
        .map(|path| FileWriter::new(path, config.max_records_per_file, config.max_backups));
    let loki = match &config.loki_endpoint {
        Some(endpoint) => Some(Arc::new(LokiClient::new(endpoint.clone())?)),
        None => None,
    };
    let dispatcher = tokio::spawn(
        pipeline::Dispatcher::new(rx, file, loki, config.silence_stdout, shutdown.clone()).run(),
    );

    info!("tracing write calls, hit Ctrl-C to stop");
    wait_for_shutdown_signal().await?;

    info!("shutting down");
    shutdown.cancel();

    match reader.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "ring reader failed"),
        Err(e) => warn!(error = %e, "ring reader task panicked"),
    }
    if let Err(e) = dispatcher.await {
        warn!(error = %e, "dispatcher task failed");
    }

    // Dropping the tracer detaches the probes and closes the maps.
    drop(tracer);
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("install SIGINT handler"),
        _ = term.recv() => Ok(()),
    }
}
