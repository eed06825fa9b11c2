pub mod dispatcher;
pub mod downloader;
pub mod events;
pub mod lifecycle;
mod routes;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::daemon::dispatcher::{Action, ActionSender};
use crate::daemon::downloader::DownloadQueue;
use crate::daemon::events::Events;
use crate::daemon::lifecycle::{OsSignaler, ProcessSignaler};
use crate::db::{JobStatus, JobStore};

/// Everything a request handler or worker needs, constructed once by
/// `start` and passed down explicitly.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub actions: ActionSender,
    pub queue: Arc<DownloadQueue>,
    pub events: Arc<Events>,
    pub signaler: Arc<dyn ProcessSignaler>,
    pub db_path: PathBuf,
}

fn pid_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("grab.pid")
}

fn socket_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("grab.sock")
}

fn cleanup(runtime_dir: &Path) {
    let pid = pid_path(runtime_dir);
    let sock = socket_path(runtime_dir);
    if pid.exists() {
        let _ = fs::remove_file(&pid);
        tracing::debug!(path = %pid.display(), "removed PID file");
    }
    if sock.exists() {
        let _ = fs::remove_file(&sock);
        tracing::debug!(path = %sock.display(), "removed socket file");
    }
}

/// Re-submit every job a previous run left unfinished. Runs before the
/// listener accepts requests, so resumed work is first in line. A job
/// that actually finished but never recorded it gets run again; that is
/// the accepted trade for never losing one.
fn resume_unfinished(store: &JobStore, actions: &ActionSender) -> anyhow::Result<usize> {
    let unfinished = store.resumable()?;
    let count = unfinished.len();

    for mut job in unfinished {
        tracing::info!(id = job.id, status = %job.status, "re-queueing unfinished job");
        job.status = JobStatus::Pending;
        job.pid = 0;
        let _ = actions.send(Action::Resume(job));
    }

    Ok(count)
}

pub async fn start(force: bool) -> anyhow::Result<()> {
    tracing::info!(
        config = %crate::paths::config_dir()?.display(),
        data = %crate::paths::data_dir()?.display(),
        runtime = %crate::paths::runtime_dir()?.display(),
        "starting daemon"
    );

    let runtime_dir = crate::paths::runtime_dir()?;
    fs::create_dir_all(&runtime_dir)?;

    let pid = pid_path(&runtime_dir);
    let sock = socket_path(&runtime_dir);

    if pid.exists() || sock.exists() {
        if force {
            tracing::debug!("--force: removing existing runtime files");
            cleanup(&runtime_dir);
        } else {
            anyhow::bail!(
                "daemon already running (found runtime files in {}); use --force to override",
                runtime_dir.display()
            );
        }
    }

    let config = Arc::new(crate::config::load()?);

    let db_path = crate::paths::database_path()?;
    let store = JobStore::open(&db_path)?;
    tracing::debug!(path = %db_path.display(), "database initialized");

    fs::write(&pid, std::process::id().to_string())?;
    tracing::debug!(path = %pid.display(), pid = std::process::id(), "wrote PID file");

    let (actions_tx, actions_rx) = mpsc::unbounded_channel();
    let queue = DownloadQueue::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let resumed = resume_unfinished(&store, &actions_tx)?;
    if resumed > 0 {
        tracing::info!(count = resumed, "resumed unfinished jobs");
    }

    let dispatcher_handle = tokio::spawn(dispatcher::run(
        store,
        actions_rx,
        queue.clone(),
        config.max_log_entries(),
        shutdown_rx.clone(),
    ));

    let worker_ctx = downloader::WorkerContext {
        config: config.clone(),
        actions: actions_tx.clone(),
        queue: queue.clone(),
    };
    let worker_handles: Vec<_> = (0..config.workers())
        .map(|worker| tokio::spawn(downloader::run(worker, worker_ctx.clone(), shutdown_rx.clone())))
        .collect();

    let state = AppState {
        config,
        actions: actions_tx,
        queue,
        events: Arc::new(Events::new()),
        signaler: Arc::new(OsSignaler),
        db_path,
    };

    let listener = UnixListener::bind(&sock)?;
    tracing::info!(socket = %sock.display(), "listening");

    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/events", get(routes::events))
        .route("/downloads", post(routes::create_download))
        .route("/jobs", get(routes::list_jobs))
        .route("/jobs/clean", post(routes::clean_jobs))
        .route("/jobs/purge", post(routes::purge_jobs))
        .route(
            "/jobs/{id}",
            get(routes::get_job).delete(routes::delete_job),
        )
        .route("/jobs/{id}/stop", post(routes::stop_job))
        .route("/jobs/{id}/retry", post(routes::retry_job))
        .route("/stats", get(routes::stats))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    tracing::info_span!("request", method = %req.method(), path = %req.uri().path())
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::info!(status = %res.status().as_u16(), latency_ms = latency.as_millis(), "response");
                    },
                ),
        )
        .with_state(state.clone());

    let events = state.events.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("closing event streams");
            events.shutdown();
        })
        .await?;

    // Spawn a task that forces exit on a second signal.
    let rd = runtime_dir.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("received second signal, forcing shutdown");
        cleanup(&rd);
        std::process::exit(1);
    });

    tracing::info!("stopping dispatcher and workers");
    let _ = shutdown_tx.send(true);
    let _ = dispatcher_handle.await;
    for handle in worker_handles {
        let _ = handle.await;
    }

    cleanup(&runtime_dir);
    tracing::info!("daemon shut down");

    Ok(())
}

const LABEL: &str = "com.grab.daemon";

fn plist_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("could not determine home directory"))?;
    Ok(home
        .join("Library/LaunchAgents")
        .join(format!("{LABEL}.plist")))
}

fn get_uid() -> anyhow::Result<String> {
    let output = Command::new("id").arg("-u").output()?;
    if !output.status.success() {
        anyhow::bail!("failed to get uid");
    }
    Ok(String::from_utf8(output.stdout)?.trim().to_string())
}

pub fn install() -> anyhow::Result<()> {
    let binary_path = std::env::current_exe()?;
    let state_dir = crate::paths::state_dir()?;
    fs::create_dir_all(&state_dir)?;

    let plist = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{binary}</string>
        <string>daemon</string>
        <string>start</string>
        <string>--force</string>
    </array>
    <key>KeepAlive</key>
    <true/>
    <key>StandardOutPath</key>
    <string>{out_log}</string>
    <key>StandardErrorPath</key>
    <string>{err_log}</string>
</dict>
</plist>
"#,
        label = LABEL,
        binary = binary_path.display(),
        out_log = state_dir.join("daemon.out.log").display(),
        err_log = state_dir.join("daemon.err.log").display(),
    );

    let plist_path = plist_path()?;
    fs::create_dir_all(plist_path.parent().unwrap())?;
    fs::write(&plist_path, &plist)?;

    let uid = get_uid()?;
    let status = Command::new("launchctl")
        .args([
            "bootstrap",
            &format!("gui/{uid}"),
            &plist_path.to_string_lossy(),
        ])
        .status()?;

    if !status.success() {
        anyhow::bail!("launchctl bootstrap failed with {status}");
    }

    println!("daemon installed and started ({})", plist_path.display());
    Ok(())
}

pub fn uninstall() -> anyhow::Result<()> {
    let plist_path = plist_path()?;
    let uid = get_uid()?;

    let status = Command::new("launchctl")
        .args([
            "bootout",
            &format!("gui/{uid}"),
            &plist_path.to_string_lossy(),
        ])
        .status()?;

    if !status.success() {
        anyhow::bail!("launchctl bootout failed with {status}");
    }

    fs::remove_file(&plist_path)?;
    println!("daemon uninstalled ({})", plist_path.display());
    Ok(())
}

async fn shutdown_signal() {
    let mut sigint =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).unwrap();
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).unwrap();

    tokio::select! {
        _ = sigint.recv() => { tracing::debug!("received SIGINT"); }
        _ = sigterm.recv() => { tracing::debug!("received SIGTERM"); }
    }
}
