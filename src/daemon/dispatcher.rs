use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::daemon::downloader::DownloadQueue;
use crate::db::{Job, JobStatus, JobStore};

/// One queued instruction for the job store. Every mutation the daemon
/// performs goes through one of these; nothing else writes to the store.
#[derive(Debug)]
pub enum Action {
    /// Prune history to the retention bound, persist the job, hand it to
    /// the download queue.
    Insert(Job),
    /// Full-record overwrite.
    Update(Job),
    /// Overwrite and re-enqueue; used at startup for jobs a previous run
    /// left unfinished.
    Resume(Job),
    SetName { id: i64, name: String },
    SetLog { id: i64, log: String },
    SetStatus { id: i64, status: JobStatus },
    SetPid { id: i64, pid: u32 },
    /// Prune history to the retention bound.
    CleanLogs,
    /// Delete all terminal jobs.
    PurgeLogs,
    /// Delete unless a live process owns the job.
    DeleteSafe { id: i64 },
    DeleteForce { id: i64 },
}

pub type ActionSender = mpsc::UnboundedSender<Action>;

/// Drain the action queue, applying each action to the sole writable
/// store handle. A failed action is logged and skipped; the one already
/// dequeued at shutdown is finished, the rest of the queue is not.
pub async fn run(
    store: JobStore,
    mut actions: mpsc::UnboundedReceiver<Action>,
    queue: Arc<DownloadQueue>,
    max_log_entries: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("dispatcher started");

    loop {
        tokio::select! {
            action = actions.recv() => match action {
                Some(action) => {
                    if let Err(e) = apply(&store, &queue, max_log_entries, action) {
                        tracing::error!(error = %e, "failed to apply action");
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => {
                tracing::info!("dispatcher shutting down");
                break;
            }
        }
    }
}

fn apply(
    store: &JobStore,
    queue: &DownloadQueue,
    max_log_entries: usize,
    action: Action,
) -> anyhow::Result<()> {
    match action {
        Action::Insert(mut job) => {
            // Make room before inserting so the new row never counts
            // against the bound.
            clean(store, max_log_entries.saturating_sub(1))?;
            let id = store.insert(&job)?;
            job.id = id;
            tracing::info!(id, name = %job.name, "job queued");
            queue.push(job);
        }
        Action::Update(job) => store.update(&job)?,
        Action::Resume(job) => {
            store.update(&job)?;
            tracing::info!(id = job.id, name = %job.name, "job resumed");
            queue.push(job);
        }
        Action::SetName { id, name } => store.set_name(id, &name)?,
        Action::SetLog { id, log } => store.set_log(id, &log)?,
        Action::SetStatus { id, status } => {
            tracing::debug!(id, status = %status, "status change");
            store.set_status(id, status)?;
        }
        Action::SetPid { id, pid } => store.set_pid(id, pid)?,
        Action::CleanLogs => {
            clean(store, max_log_entries)?;
        }
        Action::PurgeLogs => {
            purge(store)?;
        }
        Action::DeleteSafe { id } => {
            delete(store, id, false)?;
        }
        Action::DeleteForce { id } => {
            delete(store, id, true)?;
        }
    }
    Ok(())
}

// Compaction follows only deletions that actually removed rows; VACUUM
// holds the write lock and must not run on every pass.

fn clean(store: &JobStore, keep: usize) -> anyhow::Result<bool> {
    if store.prune(keep)? {
        store.compact()?;
        return Ok(true);
    }
    Ok(false)
}

fn purge(store: &JobStore) -> anyhow::Result<bool> {
    if store.purge_terminal()? {
        store.compact()?;
        return Ok(true);
    }
    Ok(false)
}

fn delete(store: &JobStore, id: i64, force: bool) -> anyhow::Result<bool> {
    let removed = if force {
        store.delete_force(id)?
    } else {
        store.delete_safe(id)?
    };
    if removed {
        tracing::info!(id, force, "job deleted");
        store.compact()?;
    }
    Ok(removed)
}
