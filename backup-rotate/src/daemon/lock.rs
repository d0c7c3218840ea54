//! Run lock: at most one rotation run at a time.
//!
//! The lock is a directory created with a single `mkdir`, which either
//! succeeds or fails atomically. The holder writes its pid into a token file
//! inside it so an operator can tell a live lock from a stale one.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::utils::errors::{Result, RotateError};

pub const TOKEN_FILE: &str = "pid";

/// Held lock. Released on [`LockGuard::release`] or when dropped.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl LockGuard {
    pub fn acquire(path: &Path) -> Result<Self> {
        match fs::create_dir(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = read_holder(path);
                let holder_alive = holder.map(is_process_alive);
                warn!(
                    event = "lock_contention",
                    lock = %path.display(),
                    holder = ?holder,
                    holder_alive = ?holder_alive,
                    "Lock already held, another run is active"
                );
                return Err(RotateError::LockContention {
                    path: path.to_path_buf(),
                    holder,
                    holder_alive,
                });
            }
            Err(e) => {
                return Err(RotateError::Lock(format!(
                    "failed to create {}: {}",
                    path.display(),
                    e
                )));
            }
        }

        let pid = std::process::id();
        if let Err(e) = fs::write(path.join(TOKEN_FILE), format!("{pid}\n")) {
            let _ = fs::remove_dir_all(path);
            return Err(RotateError::Lock(format!(
                "failed to write pid token in {}: {}",
                path.display(),
                e
            )));
        }

        info!(event = "lock_acquired", lock = %path.display(), pid, "Lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            pid,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Remove the pid token, then the lock directory. Safe to call more than once.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }

        remove_if_present(fs::remove_file(self.path.join(TOKEN_FILE)))?;
        remove_if_present(fs::remove_dir(&self.path))?;
        self.released = true;

        info!(event = "lock_released", lock = %self.path.display(), "Lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(
                event = "lock_release_failed",
                lock = %self.path.display(),
                error = %e,
                "Failed to release lock"
            );
        }
    }
}

fn remove_if_present(result: std::io::Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RotateError::Lock(format!("failed to remove lock: {e}"))),
    }
}

/// Pid recorded by the current lock holder, if readable.
pub fn read_holder(path: &Path) -> Option<i32> {
    fs::read_to_string(path.join(TOKEN_FILE))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Probe a pid with signal 0. EPERM still means the process exists.
pub(crate) fn is_process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
