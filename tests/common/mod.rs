#![allow(dead_code)]

use std::path::Path;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;

fn grab_bin() -> &'static str {
    env!("CARGO_BIN_EXE_grab")
}

pub fn wait_for_path(path: &Path, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if path.exists() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

pub fn wait_for_path_removed(path: &Path, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if !path.exists() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

/// Config for a daemon whose "extractor" is a shell one-liner, so tests
/// never need a real downloader on PATH.
pub fn stub_config(script: &str, workers: usize, max_log_entries: usize) -> String {
    format!(
        r#"[daemon]
workers = {workers}
max-log-entries = {max_log_entries}

[downloader]
command = "sh"
args = ["-c", "{script}", "grab-stub"]
"#
    )
}

/// A running daemon process backed by a temporary directory.
/// Sends SIGTERM and waits for exit on drop.
pub struct DaemonFixture {
    child: std::process::Child,
    pub grab_dir: TempDir,
}

impl DaemonFixture {
    /// Daemon whose downloads finish instantly.
    pub fn start() -> Self {
        Self::start_with_config(&stub_config("echo downloaded", 2, 100))
    }

    pub fn start_with_config(config: &str) -> Self {
        let tmp = TempDir::new().unwrap();

        let config_dir = tmp.path().join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("config.toml"), config).unwrap();

        let child = std::process::Command::new(grab_bin())
            .env("GRAB_HOME", tmp.path())
            .env_remove("XDG_DATA_HOME")
            .env_remove("XDG_RUNTIME_DIR")
            .env_remove("XDG_CONFIG_HOME")
            .args(["daemon", "start"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .expect("failed to spawn daemon");

        let fixture = Self {
            child,
            grab_dir: tmp,
        };

        let sock = fixture.socket_path();
        assert!(
            wait_for_path(&sock, Duration::from_secs(5)),
            "daemon socket not created"
        );

        fixture
    }

    /// Restart after an unclean death (runtime files left behind).
    pub fn restart_forced(&mut self) {
        let child = std::process::Command::new(grab_bin())
            .env("GRAB_HOME", self.grab_dir.path())
            .env_remove("XDG_DATA_HOME")
            .env_remove("XDG_RUNTIME_DIR")
            .env_remove("XDG_CONFIG_HOME")
            .args(["daemon", "start", "--force"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .expect("failed to respawn daemon");

        self.child = child;

        let pid_file = self.pid_path();
        let expected = self.child.id().to_string();
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if let Ok(contents) = std::fs::read_to_string(&pid_file)
                && contents.trim() == expected
            {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("daemon did not restart");
    }

    pub fn kill_hard(&mut self) {
        let _ = signal::kill(Pid::from_raw(self.child.id() as i32), Signal::SIGKILL);
        let _ = self.child.wait();
    }

    pub fn socket_path(&self) -> std::path::PathBuf {
        self.grab_dir.path().join("runtime/grab.sock")
    }

    pub fn pid_path(&self) -> std::path::PathBuf {
        self.grab_dir.path().join("runtime/grab.pid")
    }

    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    /// Build a CLI command that talks to this daemon's grab home.
    pub fn cmd(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(grab_bin());
        cmd.env("GRAB_HOME", self.grab_dir.path());
        cmd.env_remove("XDG_DATA_HOME");
        cmd.env_remove("XDG_RUNTIME_DIR");
        cmd.env_remove("XDG_CONFIG_HOME");
        cmd
    }

    /// Build an assert_cmd::Command that talks to this daemon's grab home.
    pub fn assert_cmd(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::Command::new(grab_bin());
        cmd.env("GRAB_HOME", self.grab_dir.path());
        cmd.env_remove("XDG_DATA_HOME");
        cmd.env_remove("XDG_RUNTIME_DIR");
        cmd.env_remove("XDG_CONFIG_HOME");
        cmd
    }

    /// Current jobs as JSON values, newest first, logs included.
    pub fn jobs_json(&self) -> Vec<serde_json::Value> {
        let output = self
            .cmd()
            .args(["jobs", "list", "--logs", "--format", "json"])
            .output()
            .expect("failed to list jobs");
        assert!(
            output.status.success(),
            "jobs list failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).expect("jobs list was not valid JSON")
    }

    /// Poll until a job with this name shows up (enqueue is async, so a
    /// 202 from the API does not mean the row is visible yet).
    pub fn wait_for_job_named(&self, name: &str, timeout: Duration) -> serde_json::Value {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(job) = self
                .jobs_json()
                .into_iter()
                .find(|j| j["name"].as_str() == Some(name))
            {
                return job;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("job named {name} never appeared");
    }

    /// Poll until the job with `id` reports `status`. Returns the job.
    pub fn wait_for_status(
        &self,
        id: i64,
        status: &str,
        timeout: Duration,
    ) -> serde_json::Value {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(job) = self
                .jobs_json()
                .into_iter()
                .find(|j| j["id"].as_i64() == Some(id))
                && job["status"].as_str() == Some(status)
            {
                return job;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!(
            "job {id} never reached {status}; jobs: {:?}",
            self.jobs_json()
        );
    }

    /// Poll until no job with `id` remains.
    pub fn wait_for_removal(&self, id: i64, timeout: Duration) {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if !self
                .jobs_json()
                .iter()
                .any(|j| j["id"].as_i64() == Some(id))
            {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!("job {id} was never removed");
    }
}

impl Drop for DaemonFixture {
    fn drop(&mut self) {
        let _ = signal::kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM);
        let _ = self.child.wait();
    }
}
