use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::daemon::dispatcher::{Action, ActionSender};
use crate::db::{Job, JobStatus};

/// Interrupt delivery to a download process. A trait seam so the stop
/// path can be exercised against a fake instead of a live process.
pub trait ProcessSignaler: Send + Sync {
    /// Deliver SIGINT. Ok(false) means the process was already gone,
    /// which callers treat as success: the desired end state holds.
    fn interrupt(&self, pid: u32) -> anyhow::Result<bool>;
}

pub struct OsSignaler;

impl ProcessSignaler for OsSignaler {
    fn interrupt(&self, pid: u32) -> anyhow::Result<bool> {
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// No process to signal; an Aborted status change was enqueued.
    Aborted,
    /// The process was signaled (or already gone); the owning worker
    /// observes the interrupt and records the terminal status itself.
    Signaled,
    /// The job's state makes stopping meaningless.
    Noop,
}

pub fn stop_job(
    job: &Job,
    signaler: &dyn ProcessSignaler,
    actions: &ActionSender,
) -> anyhow::Result<StopOutcome> {
    match (job.status, job.pid) {
        (JobStatus::Pending, _) => {
            tracing::info!(id = job.id, "aborting pending job");
            let _ = actions.send(Action::SetStatus {
                id: job.id,
                status: JobStatus::Aborted,
            });
            Ok(StopOutcome::Aborted)
        }
        (JobStatus::Running, pid) if pid != 0 => {
            let delivered = signaler.interrupt(pid)?;
            if delivered {
                tracing::info!(id = job.id, pid, "interrupted running job");
            } else {
                tracing::info!(id = job.id, pid, "process already gone");
            }
            Ok(StopOutcome::Signaled)
        }
        (JobStatus::Running, _) => {
            // Claimed by a worker that has not recorded a pid yet; there
            // is no process to target, so abort the record directly.
            tracing::info!(id = job.id, "aborting claimed job without pid");
            let _ = actions.send(Action::SetStatus {
                id: job.id,
                status: JobStatus::Aborted,
            });
            Ok(StopOutcome::Aborted)
        }
        _ => Ok(StopOutcome::Noop),
    }
}

/// Queue a fresh clone of `source` and a safe delete of the original.
/// Both land on the same dispatcher queue, so the delete attempt always
/// precedes the insert in the store's history; whether the original
/// actually goes depends on its status when the delete drains.
pub fn retry_job(source: &Job, actions: &ActionSender) -> Job {
    let clone = Job::retry_of(source);
    tracing::info!(source = source.id, name = %clone.name, "retrying job");
    let _ = actions.send(Action::DeleteSafe { id: source.id });
    let _ = actions.send(Action::Insert(clone.clone()));
    clone
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use super::*;

    #[derive(Default)]
    struct FakeSignaler {
        delivered: Mutex<Vec<u32>>,
        gone: bool,
    }

    impl ProcessSignaler for FakeSignaler {
        fn interrupt(&self, pid: u32) -> anyhow::Result<bool> {
            self.delivered.lock().unwrap().push(pid);
            Ok(!self.gone)
        }
    }

    fn job(status: JobStatus, pid: u32) -> Job {
        let mut job = Job::new_download(
            "video/best",
            vec!["http://x".into()],
            serde_json::json!({}),
            false,
        );
        job.id = 7;
        job.status = status;
        job.pid = pid;
        job
    }

    fn channel() -> (ActionSender, mpsc::UnboundedReceiver<Action>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn stop_pending_aborts_without_signaling() {
        let (tx, mut rx) = channel();
        let signaler = FakeSignaler::default();

        let outcome = stop_job(&job(JobStatus::Pending, 0), &signaler, &tx).unwrap();

        assert_eq!(outcome, StopOutcome::Aborted);
        assert!(signaler.delivered.lock().unwrap().is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Action::SetStatus {
                id: 7,
                status: JobStatus::Aborted
            }
        ));
    }

    #[test]
    fn stop_running_signals_pid_and_leaves_status_alone() {
        let (tx, mut rx) = channel();
        let signaler = FakeSignaler::default();

        let outcome = stop_job(&job(JobStatus::Running, 4821), &signaler, &tx).unwrap();

        assert_eq!(outcome, StopOutcome::Signaled);
        assert_eq!(*signaler.delivered.lock().unwrap(), vec![4821]);
        // No status action: the worker observes the signal and records
        // the terminal status itself.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stop_running_swallows_already_gone_process() {
        let (tx, _rx) = channel();
        let signaler = FakeSignaler {
            gone: true,
            ..Default::default()
        };

        let outcome = stop_job(&job(JobStatus::Running, 4821), &signaler, &tx).unwrap();
        assert_eq!(outcome, StopOutcome::Signaled);
    }

    #[test]
    fn stop_running_without_pid_aborts_directly() {
        let (tx, mut rx) = channel();
        let signaler = FakeSignaler::default();

        let outcome = stop_job(&job(JobStatus::Running, 0), &signaler, &tx).unwrap();

        assert_eq!(outcome, StopOutcome::Aborted);
        assert!(signaler.delivered.lock().unwrap().is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Action::SetStatus {
                id: 7,
                status: JobStatus::Aborted
            }
        ));
    }

    #[test]
    fn stop_terminal_job_is_a_noop() {
        let (tx, mut rx) = channel();
        let signaler = FakeSignaler::default();

        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Aborted] {
            let outcome = stop_job(&job(status, 0), &signaler, &tx).unwrap();
            assert_eq!(outcome, StopOutcome::Noop);
        }
        assert!(signaler.delivered.lock().unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn retry_enqueues_safe_delete_then_insert_of_clone() {
        let (tx, mut rx) = channel();
        let mut source = job(JobStatus::Failed, 0);
        source.urls = vec!["http://a".into(), "http://b".into()];
        source.name = "http://a, http://b".into();
        source.log = "old failure output".into();

        let clone = retry_job(&source, &tx);

        assert_eq!(clone.status, JobStatus::Pending);
        assert_eq!(clone.urls, source.urls);
        assert_eq!(clone.format, source.format);
        assert_eq!(clone.name, source.name);
        assert!(clone.log.is_empty());

        assert!(matches!(rx.try_recv().unwrap(), Action::DeleteSafe { id: 7 }));
        match rx.try_recv().unwrap() {
            Action::Insert(inserted) => {
                assert_eq!(inserted.status, JobStatus::Pending);
                assert_eq!(inserted.urls, source.urls);
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }
}
