//! Graceful daemon shutdown, supplementing §4.8's per-job `Stop` protocol to the whole daemon:
//! on SIGTERM/SIGINT, stop admitting new jobs, `Stop` every non-terminal job, wait up to
//! `cleanup_timeout` for teardown, then return so `main` can exit `0`.

use joblet_exec::Engine;
use joblet_store::{JobFilter, JobStore};
use slog::{info, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

/// Waits for SIGTERM or SIGINT, then drains every running job before returning. The caller stops
/// accepting new RPCs as soon as this future is polled the first time; that's the caller's
/// responsibility since it owns the RPC front door, not this function's.
pub async fn graceful_shutdown(engine: Arc<Engine>, store: Arc<JobStore>, cleanup_timeout: Duration, logger: Logger) {
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => info!(logger, "received SIGTERM, shutting down"),
        _ = sigint.recv() => info!(logger, "received SIGINT, shutting down"),
    }

    let non_terminal: Vec<_> = store
        .list(&JobFilter::default())
        .into_iter()
        .filter(|job| !job.status.is_terminal())
        .map(|job| job.uuid)
        .collect();
    info!(logger, "stopping non-terminal jobs"; "count" => non_terminal.len());
    for job_uuid in &non_terminal {
        if let Err(err) = engine.stop(*job_uuid).await {
            warn!(logger, "failed to stop job during shutdown"; "job" => %job_uuid, "error" => %err);
        }
    }

    let deadline = tokio::time::Instant::now() + cleanup_timeout;
    loop {
        let still_running = store
            .list(&JobFilter::default())
            .into_iter()
            .filter(|job| !job.status.is_terminal())
            .count();
        if still_running == 0 || tokio::time::Instant::now() >= deadline {
            if still_running > 0 {
                warn!(logger, "shutdown proceeding with jobs still non-terminal"; "count" => still_running);
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    info!(logger, "shutdown complete");
}
