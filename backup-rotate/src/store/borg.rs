//! `borg`-compatible command line archive store.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

use super::ArchiveStore;
use crate::config::StoreConfig;
use crate::utils::errors::{Result, RotateError};

/// Invokes the archive tool as a child process for every store call.
#[derive(Debug, Clone)]
pub struct BorgStore {
    command: String,
    repository: Option<String>,
    create_options: Vec<String>,
    env: Vec<(String, String)>,
    running: Arc<Mutex<Running>>,
}

#[derive(Debug, Default)]
struct Running {
    /// Pid of the tool invocation in flight, if any.
    pid: Option<u32>,
    /// Set by `cancel`; later calls fail without starting the tool.
    cancelled: bool,
}

impl BorgStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            command: config.command.clone(),
            repository: config.repository.clone(),
            create_options: config.create_options.clone(),
            env: config
                .env_pairs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            running: Arc::default(),
        }
    }

    /// `<repo>::<name>`, or `::<name>` when the repository comes from the tool's environment.
    fn archive_ref(&self, name: &str) -> String {
        format!("{}::{}", self.repository.as_deref().unwrap_or(""), name)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
        cmd
    }

    fn run(&self, op: &'static str, mut cmd: Command) -> Result<Output> {
        let started = Instant::now();
        let child = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            if running.cancelled {
                return Err(RotateError::store(op, "cancelled"));
            }
            let child = cmd
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| {
                    RotateError::store(op, format!("failed to run {}: {}", self.command, e))
                })?;
            running.pid = Some(child.id());
            child
        };

        let output = child.wait_with_output();
        self.running.lock().unwrap_or_else(|e| e.into_inner()).pid = None;
        let output = output.map_err(|e| {
            RotateError::store(op, format!("failed to wait for {}: {}", self.command, e))
        })?;

        debug!(
            event = "store_call",
            op,
            status = output.status.code().unwrap_or(-1),
            duration_ms = started.elapsed().as_millis() as u64,
            "Archive store call finished"
        );

        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = match stderr.trim() {
                "" => format!("{} exited with {}", self.command, output.status),
                msg => msg.to_string(),
            };
            Err(RotateError::store(op, detail))
        }
    }
}

/// Path of `path` relative to `source_root`, so the archive stores it without the root prefix.
fn relative_to_root(source_root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix(source_root) {
        Ok(rel) if rel.as_os_str().is_empty() => PathBuf::from("."),
        Ok(rel) => rel.to_path_buf(),
        Err(_) => path.to_path_buf(),
    }
}

impl ArchiveStore for BorgStore {
    fn list_archives(&self) -> Result<Vec<String>> {
        let mut cmd = self.command();
        cmd.args(["list", "--short"]);
        if let Some(repo) = &self.repository {
            cmd.arg(repo);
        }

        let output = self.run("list", cmd)?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn create_archive(&self, name: &str, source_root: &Path, path: &Path) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("create")
            .args(&self.create_options)
            .arg(self.archive_ref(name))
            .arg(relative_to_root(source_root, path))
            .current_dir(source_root);

        self.run("create", cmd).map(|_| ())
    }

    fn delete_archive(&self, name: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("delete").arg(self.archive_ref(name));

        self.run("delete", cmd).map(|_| ())
    }

    /// Send SIGTERM to the running tool invocation, so it does not outlive the
    /// run, and refuse any further calls.
    fn cancel(&self) {
        let pid = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            running.cancelled = true;
            running.pid
        };
        let Some(pid) = pid else {
            return;
        };

        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => warn!(event = "store_cancel", pid, "Stopped running archive tool"),
            Err(e) => warn!(
                event = "store_cancel_failed",
                pid,
                error = %e,
                "Failed to stop archive tool"
            ),
        }
    }
}
