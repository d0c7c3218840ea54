//! Custom error types for the rotation controller.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RotateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another run holds the lock. `holder` is the pid recorded in its token file.
    #[error("Lock {} is held{}", .path.display(), describe_holder(.holder, .holder_alive))]
    LockContention {
        path: PathBuf,
        holder: Option<i32>,
        holder_alive: Option<bool>,
    },

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Archive store {op} failed: {detail}")]
    Store { op: &'static str, detail: String },

    #[error("Hook script error: {0}")]
    HookScript(String),

    #[error("Malformed archive name: {0}")]
    MalformedArchiveName(String),

    #[error("Run interrupted by {0}")]
    Interrupted(String),

    #[error("Run task failed: {0}")]
    Task(String),
}

fn describe_holder(holder: &Option<i32>, alive: &Option<bool>) -> String {
    match (*holder, *alive) {
        (Some(pid), Some(true)) => format!(" by running process {pid}"),
        (Some(pid), Some(false)) => format!(" by process {pid}, which is not running (stale lock)"),
        (Some(pid), None) => format!(" by process {pid}"),
        (None, _) => String::new(),
    }
}

impl RotateError {
    pub fn store(op: &'static str, detail: impl Into<String>) -> Self {
        Self::Store {
            op,
            detail: detail.into(),
        }
    }

    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }
}

pub type Result<T> = std::result::Result<T, RotateError>;
