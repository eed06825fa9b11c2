use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, mpsc, watch};

use crate::config::Config;
use crate::daemon::dispatcher::{Action, ActionSender};
use crate::db::{Job, JobStatus};

/// The dispatch queue feeding the worker pool. Unbounded so producers
/// never block; the depth counter backs the stats endpoint, since the
/// channel itself exposes no length.
pub struct DownloadQueue {
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<mpsc::UnboundedReceiver<Job>>,
    depth: AtomicUsize,
}

impl DownloadQueue {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, job: Job) {
        if self.tx.send(job).is_ok() {
            self.depth.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take the next job; workers share the receiver behind the mutex.
    pub async fn claim(&self) -> Option<Job> {
        let job = self.rx.lock().await.recv().await;
        if job.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        job
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<Config>,
    pub actions: ActionSender,
    pub queue: Arc<DownloadQueue>,
}

pub async fn run(worker: usize, ctx: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    tracing::info!(worker, "download worker started");

    loop {
        tokio::select! {
            job = ctx.queue.claim() => match job {
                Some(job) => execute(&ctx, job, &mut shutdown).await,
                None => break,
            },
            _ = shutdown.changed() => {
                tracing::info!(worker, "download worker shutting down");
                break;
            }
        }
    }
}

/// Run one job to a terminal status. Every state change goes back
/// through the action queue; this task never touches the store.
async fn execute(ctx: &WorkerContext, mut job: Job, shutdown: &mut watch::Receiver<bool>) {
    let id = job.id;
    tracing::info!(id, name = %job.name, "starting download");

    // Claiming the job also clears any pid a resumed row carried over.
    job.status = JobStatus::Running;
    job.pid = 0;
    let _ = ctx.actions.send(Action::Update(job.clone()));

    let mut command = match build_command(&ctx.config, &job) {
        Ok(command) => command,
        Err(e) => {
            fail(ctx, id, &format!("could not prepare download: {e}\n"));
            return;
        }
    };

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            fail(
                ctx,
                id,
                &format!("failed to spawn {}: {e}\n", ctx.config.downloader_command()),
            );
            return;
        }
    };

    let pid = child.id().unwrap_or(0);
    let _ = ctx.actions.send(Action::SetPid { id, pid });
    tracing::debug!(id, pid, "download process spawned");

    let result = tokio::select! {
        result = supervise(ctx, id, &mut child) => result,
        _ = shutdown.changed() => {
            // Shutdown does not wait for the extraction: kill it and
            // leave the record Running for the next start's resume scan.
            tracing::warn!(id, "shutdown during download, killing process");
            let _ = child.start_kill();
            return;
        }
    };

    let (status, log) = match result {
        Ok(pair) => pair,
        Err(e) => {
            fail(ctx, id, &format!("download process lost: {e}\n"));
            return;
        }
    };

    let terminal = classify_exit(status);
    tracing::info!(id, status = %terminal, "download finished");

    // Pid goes first: a job observed in a terminal status never shows
    // a live process.
    let _ = ctx.actions.send(Action::SetLog { id, log });
    let _ = ctx.actions.send(Action::SetPid { id, pid: 0 });
    let _ = ctx.actions.send(Action::SetStatus {
        id,
        status: terminal,
    });
}

/// Stream interleaved output into the log (replacing it after every
/// line) until both pipes close, then reap the exit status.
async fn supervise(
    ctx: &WorkerContext,
    id: i64,
    child: &mut tokio::process::Child,
) -> anyhow::Result<(std::process::ExitStatus, String)> {
    let mut log = String::new();
    let mut out_lines = child
        .stdout
        .take()
        .map(|out| BufReader::new(out).lines());
    let mut err_lines = child
        .stderr
        .take()
        .map(|err| BufReader::new(err).lines());

    loop {
        tokio::select! {
            line = next_line(&mut out_lines), if out_lines.is_some() => {
                match line {
                    Some(line) => append_log(ctx, id, &mut log, &line),
                    None => out_lines = None,
                }
            }
            line = next_line(&mut err_lines), if err_lines.is_some() => {
                match line {
                    Some(line) => append_log(ctx, id, &mut log, &line),
                    None => err_lines = None,
                }
            }
            else => break,
        }
    }

    let status = child.wait().await?;
    Ok((status, log))
}

async fn next_line(
    lines: &mut Option<tokio::io::Lines<BufReader<impl tokio::io::AsyncRead + Unpin>>>,
) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

fn append_log(ctx: &WorkerContext, id: i64, log: &mut String, line: &str) {
    log.push_str(line);
    log.push('\n');
    let _ = ctx.actions.send(Action::SetLog {
        id,
        log: log.clone(),
    });
}

fn fail(ctx: &WorkerContext, id: i64, log: &str) {
    tracing::error!(id, log, "download failed before completion");
    let _ = ctx.actions.send(Action::SetLog {
        id,
        log: log.to_owned(),
    });
    let _ = ctx.actions.send(Action::SetPid { id, pid: 0 });
    let _ = ctx.actions.send(Action::SetStatus {
        id,
        status: JobStatus::Failed,
    });
}

/// An interrupt delivered by the stop path (or any signal death) records
/// Aborted; any other non-zero exit is a plain failure.
fn classify_exit(status: std::process::ExitStatus) -> JobStatus {
    use std::os::unix::process::ExitStatusExt;

    if status.success() {
        JobStatus::Completed
    } else if status.signal().is_some() {
        JobStatus::Aborted
    } else {
        JobStatus::Failed
    }
}

fn build_command(config: &Config, job: &Job) -> anyhow::Result<tokio::process::Command> {
    let download_dir = config.download_dir()?;
    std::fs::create_dir_all(&download_dir)?;

    let mut command = tokio::process::Command::new(config.downloader_command());
    command
        .args(config.downloader_args())
        .current_dir(&download_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let format = if job.format.is_empty() {
        config.default_format()
    } else {
        job.format.as_str()
    };
    if !format.is_empty() {
        command.args(["-f", format]);
    }

    if job.force_generic_extractor {
        command.arg("--force-generic-extractor");
    }

    if let Some(params) = job.extra_params.as_object() {
        for (key, value) in params {
            command.arg(format!("--{key}"));
            match value {
                serde_json::Value::Bool(_) => {}
                serde_json::Value::String(s) => {
                    command.arg(s);
                }
                other => {
                    command.arg(other.to_string());
                }
            }
        }
    }

    command.args(&job.urls);
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_depth_tracks_push_and_claim() {
        let queue = DownloadQueue::new();
        queue.push(Job::new_download(
            "",
            vec!["http://x".into()],
            serde_json::json!({}),
            false,
        ));
        queue.push(Job::new_download(
            "",
            vec!["http://y".into()],
            serde_json::json!({}),
            false,
        ));
        assert_eq!(queue.depth(), 2);

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let job = rt.block_on(queue.claim()).unwrap();
        assert_eq!(job.urls, vec!["http://x"]);
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn exit_classification() {
        use std::os::unix::process::ExitStatusExt;
        use std::process::ExitStatus;

        assert_eq!(
            classify_exit(ExitStatus::from_raw(0)),
            JobStatus::Completed
        );
        // Raw wait status 2: killed by SIGINT.
        assert_eq!(classify_exit(ExitStatus::from_raw(2)), JobStatus::Aborted);
        // Exit code 1: normal failure.
        assert_eq!(
            classify_exit(ExitStatus::from_raw(1 << 8)),
            JobStatus::Failed
        );
    }

    #[test]
    fn command_includes_format_flags_and_urls() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config: Config = toml::from_str(&format!(
            r#"
            [downloader]
            command = "echo"
            args = ["--no-color"]
            download-dir = "{}"
            "#,
            tmp.path().display()
        ))
        .unwrap();

        let mut job = Job::new_download(
            "bestaudio",
            vec!["http://a".into(), "http://b".into()],
            serde_json::json!({"proxy": "socks5://localhost"}),
            true,
        );
        job.id = 1;

        let command = build_command(&config, &job).unwrap();
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert!(args.contains(&"--no-color".to_owned()));
        assert!(args.contains(&"-f".to_owned()));
        assert!(args.contains(&"bestaudio".to_owned()));
        assert!(args.contains(&"--force-generic-extractor".to_owned()));
        assert!(args.contains(&"--proxy".to_owned()));
        assert!(args.contains(&"socks5://localhost".to_owned()));
        let a = args.iter().position(|x| x == "http://a").unwrap();
        let b = args.iter().position(|x| x == "http://b").unwrap();
        assert!(a < b);
    }
}
