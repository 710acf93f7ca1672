use anyhow::{Context, Result};
use rollcall_core::{PresenceTracker, RosterStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

mod backend;
mod config;
mod dbus_interface;
mod engine;
mod sync;
mod tasks;

use backend::BackendClient;
use config::Config;
use sync::{RetryPolicy, SyncWorker};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        backend = %config.backend_url,
        room = config.room_filter().unwrap_or("*"),
        camera = %config.camera_device,
        "configuration loaded"
    );

    let backend = BackendClient::new(&config.backend_url, config.http_timeout())
        .context("building backend client")?;

    // A failed first load is not fatal; the refresh task keeps trying.
    let roster = Arc::new(RosterStore::new(Some(config.embedding_dim)));
    if roster
        .refresh(&backend, config.room_filter(), tasks::now_ms())
        .await
        .is_err()
    {
        tracing::warn!("starting with an empty roster");
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (reports_tx, reports_rx) = mpsc::unbounded_channel();
    let tracker = Arc::new(PresenceTracker::new(config.presence_timeout_ms(), events_tx));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let frame_loop = match engine::spawn_frame_loop(
        &config,
        Arc::clone(&roster),
        Arc::clone(&tracker),
        shutdown_rx.clone(),
    ) {
        Ok(frame_loop) => frame_loop,
        Err(err) => {
            tracing::error!(error = %err, "startup failed");
            return Err(err).context("starting frame loop");
        }
    };

    let (drain_tx, drain_rx) = oneshot::channel();
    let worker = SyncWorker::new(
        backend.clone(),
        config.room_filter().map(str::to_string),
        RetryPolicy::new(
            config.retry_max_attempts,
            Duration::from_millis(config.retry_base_delay_ms),
        ),
        reports_tx,
    );
    let sync_task = tokio::spawn(worker.run(events_rx, drain_rx));

    let refresh_trigger = Arc::new(Notify::new());
    let refresh_task = tokio::spawn(tasks::roster_refresh_loop(
        Arc::clone(&roster),
        backend,
        config.room_filter().map(str::to_string),
        config.roster_refresh_interval(),
        Arc::clone(&refresh_trigger),
        shutdown_rx.clone(),
    ));
    let presence_task = tokio::spawn(tasks::presence_loop(
        Arc::clone(&tracker),
        config.sweep_interval(),
        config.heartbeat_interval(),
        reports_rx,
        shutdown_rx,
    ));

    let service = dbus_interface::AttendanceService::new(
        Arc::clone(&roster),
        Arc::clone(&tracker),
        frame_loop.stats(),
        refresh_trigger,
        config.room_filter().map(str::to_string),
        config.camera_device.clone(),
    );
    let _dbus = match dbus_interface::serve(service, config.dbus_session_bus).await {
        Ok(conn) => {
            tracing::info!(name = dbus_interface::BUS_NAME, "D-Bus interface registered");
            Some(conn)
        }
        Err(err) => {
            tracing::warn!(error = %err, "D-Bus unavailable; continuing without control interface");
            None
        }
    };

    tracing::info!("rollcalld ready");
    wait_for_signal().await?;
    tracing::info!("rollcalld shutting down");

    // One grace period covers the whole shutdown sequence.
    let deadline = Instant::now() + config.shutdown_grace();
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout_at(deadline, tokio::task::spawn_blocking(move || frame_loop.join()))
        .await
    {
        Ok(Ok(Ok(_))) => {}
        Ok(Ok(Err(err))) => tracing::warn!(error = %err, "frame loop ended abnormally"),
        Ok(Err(err)) => tracing::warn!(error = %err, "frame loop join failed"),
        Err(_) => tracing::warn!("frame loop did not stop within grace period"),
    }
    join_by(deadline, "roster refresh", refresh_task).await;
    join_by(deadline, "presence", presence_task).await;

    let closed = tracker.close_all(tasks::now_ms());
    tracing::info!(closed, "open presences checked out");

    let _ = drain_tx.send(());
    join_by(deadline, "sync worker", sync_task).await;

    tracing::info!("rollcalld stopped");
    Ok(())
}

/// Wait for `task` until `deadline`, then abort it.
async fn join_by(deadline: Instant, name: &str, task: JoinHandle<()>) {
    let abort = task.abort_handle();
    match tokio::time::timeout_at(deadline, task).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(task = name, error = %err, "task failed"),
        Err(_) => {
            tracing::warn!(task = name, "task did not stop within grace period; aborting");
            abort.abort();
        }
    }
}

async fn wait_for_signal() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("waiting for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stuck_tasks_share_one_deadline() {
        let grace = Duration::from_millis(300);
        let start = Instant::now();
        let deadline = start + grace;

        let stuck: Vec<JoinHandle<()>> = (0..3)
            .map(|_| tokio::spawn(std::future::pending::<()>()))
            .collect();
        for task in stuck {
            join_by(deadline, "stuck", task).await;
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= grace);
        assert!(elapsed < grace * 2, "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_finished_task_joins_before_deadline() {
        let task = tokio::spawn(async {});
        let start = Instant::now();
        join_by(start + Duration::from_secs(5), "quick", task).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
