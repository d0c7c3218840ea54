//! Pre/post-backup hook scripts.

use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use std::time::Instant;
use tracing::{error, info};

use crate::utils::errors::{Result, RotateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    PreBackup,
    PostBackup,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookStage::PreBackup => f.write_str("pre-backup"),
            HookStage::PostBackup => f.write_str("post-backup"),
        }
    }
}

/// Fail unless `path` is a regular file with at least one execute bit set.
pub fn ensure_executable(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| RotateError::HookScript(format!("{}: {}", path.display(), e)))?;

    if !metadata.is_file() {
        return Err(RotateError::HookScript(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(RotateError::HookScript(format!(
            "{} is not executable",
            path.display()
        )));
    }
    Ok(())
}

/// Run a hook to completion. A non-zero exit status is an error.
pub fn run(stage: HookStage, path: &Path, env: &[(&str, &str)]) -> Result<()> {
    ensure_executable(path)?;

    let started = Instant::now();
    info!(event = "hook_start", stage = %stage, hook = %path.display(), "Running hook");

    let output = Command::new(path)
        .envs(env.iter().copied())
        .output()
        .map_err(|e| RotateError::HookScript(format!("{}: {}", path.display(), e)))?;

    let duration_ms = started.elapsed().as_millis() as u64;
    if output.status.success() {
        info!(
            event = "hook_finish",
            stage = %stage,
            hook = %path.display(),
            duration_ms,
            "Hook finished"
        );
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        error!(
            event = "hook_error",
            stage = %stage,
            hook = %path.display(),
            status = %output.status,
            duration_ms,
            error = %stderr,
            "Hook failed"
        );
        Err(RotateError::HookScript(format!(
            "{} hook {} exited with {}",
            stage,
            path.display(),
            output.status
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn test_ensure_executable() {
        let temp = TempDir::new().unwrap();
        let exec = script(temp.path(), "ok.sh", "exit 0", 0o755);
        let plain = script(temp.path(), "plain.sh", "exit 0", 0o644);

        ensure_executable(&exec).unwrap();
        assert!(matches!(ensure_executable(&plain), Err(RotateError::HookScript(_))));
        assert!(matches!(
            ensure_executable(&temp.path().join("missing.sh")),
            Err(RotateError::HookScript(_))
        ));
        assert!(matches!(ensure_executable(temp.path()), Err(RotateError::HookScript(_))));
    }

    #[test]
    fn test_run_passes_environment() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("env.out");
        let hook = script(
            temp.path(),
            "post.sh",
            &format!("echo \"$BACKUP_ROTATE_TIER $BACKUP_ROTATE_STATUS\" > {}", out.display()),
            0o755,
        );

        run(
            HookStage::PostBackup,
            &hook,
            &[("BACKUP_ROTATE_TIER", "daily"), ("BACKUP_ROTATE_STATUS", "ok")],
        )
        .unwrap();

        assert_eq!(fs::read_to_string(out).unwrap().trim(), "daily ok");
    }

    #[test]
    fn test_run_non_zero_exit_is_error() {
        let temp = TempDir::new().unwrap();
        let hook = script(temp.path(), "pre.sh", "echo 'database dump failed' >&2\nexit 3", 0o755);

        let err = run(HookStage::PreBackup, &hook, &[]).unwrap_err();
        assert!(matches!(err, RotateError::HookScript(_)));
        assert!(err.to_string().contains("pre-backup hook"));
    }
}
