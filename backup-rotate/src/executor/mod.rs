//! Backup job executor - creates one archive per target directory.
//!
//! Targets are processed in configuration order, one store call at a time.
//! A failing target is recorded and the sweep moves on; the job as a whole
//! only counts as successful when every target succeeded.

use chrono::NaiveDateTime;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::catalog::ArchiveName;
use crate::store::ArchiveStore;
use crate::tier::Tier;

/// Backup job configuration
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub host: String,
    pub tier: Tier,
    pub timestamp: NaiveDateTime,
    pub targets: Vec<PathBuf>,
}

impl BackupJob {
    /// Archive names this job creates, in target order.
    pub fn archive_names(&self) -> Vec<ArchiveName> {
        self.targets
            .iter()
            .map(|dir| ArchiveName::new(&self.host, self.tier, self.timestamp, dir))
            .collect()
    }
}

/// Outcome for a single target directory.
#[derive(Debug, Clone)]
pub struct TargetResult {
    pub directory: PathBuf,
    pub archive: String,
    pub duration: Duration,
    /// `None` on success, the store's error detail otherwise.
    pub error: Option<String>,
}

impl TargetResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Backup execution result
#[derive(Debug, Clone, Default)]
pub struct BackupResult {
    pub targets: Vec<TargetResult>,
    pub duration: Duration,
}

impl BackupResult {
    /// True when every target was archived.
    pub fn succeeded(&self) -> bool {
        self.targets.iter().all(TargetResult::succeeded)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TargetResult> {
        self.targets.iter().filter(|t| !t.succeeded())
    }
}

/// Main backup executor
pub struct BackupExecutor<'a> {
    store: &'a dyn ArchiveStore,
    source_root: PathBuf,
}

impl<'a> BackupExecutor<'a> {
    pub fn new(store: &'a dyn ArchiveStore, source_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            source_root: source_root.into(),
        }
    }

    /// Execute a backup job
    pub fn execute(&self, job: &BackupJob) -> BackupResult {
        let start_time = Instant::now();
        let mut targets = Vec::with_capacity(job.targets.len());

        for (directory, name) in job.targets.iter().zip(job.archive_names()) {
            let started = Instant::now();
            info!(
                event = "backup_start",
                tier = %job.tier,
                directory = %directory.display(),
                archive = %name,
                "Creating archive"
            );

            let outcome = self
                .store
                .create_archive(name.as_str(), &self.source_root, directory);
            let duration = started.elapsed();

            let error = match outcome {
                Ok(()) => {
                    info!(
                        event = "backup_finish",
                        tier = %job.tier,
                        directory = %directory.display(),
                        archive = %name,
                        duration_ms = duration.as_millis() as u64,
                        "Archive created"
                    );
                    None
                }
                Err(e) => {
                    error!(
                        event = "backup_error",
                        tier = %job.tier,
                        directory = %directory.display(),
                        archive = %name,
                        duration_ms = duration.as_millis() as u64,
                        error = %e,
                        "Archive creation failed"
                    );
                    Some(e.to_string())
                }
            };

            targets.push(TargetResult {
                directory: directory.clone(),
                archive: name.as_str().to_string(),
                duration,
                error,
            });
        }

        BackupResult {
            targets,
            duration: start_time.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::name::TIMESTAMP_FORMAT;
    use crate::store::mock::{MockStore, StoreCall};

    fn job(targets: &[&str]) -> BackupJob {
        BackupJob {
            host: "web01".to_string(),
            tier: Tier::Daily,
            timestamp: NaiveDateTime::parse_from_str("2024-05-06_01:02:03", TIMESTAMP_FORMAT)
                .unwrap(),
            targets: targets.iter().map(PathBuf::from).collect(),
        }
    }

    #[test]
    fn test_archive_names() {
        let names: Vec<String> = job(&["/etc", "/var/www"])
            .archive_names()
            .iter()
            .map(|n| n.to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "web01-daily-2024-05-06_01:02:03-etc",
                "web01-daily-2024-05-06_01:02:03-varwww"
            ]
        );
    }

    #[test]
    fn test_all_targets_succeed() {
        let store = MockStore::default();
        let executor = BackupExecutor::new(&store, "/");

        let result = executor.execute(&job(&["/etc", "/home"]));

        assert!(result.succeeded());
        assert_eq!(result.targets.len(), 2);
        assert_eq!(
            store.archives(),
            vec![
                "web01-daily-2024-05-06_01:02:03-etc",
                "web01-daily-2024-05-06_01:02:03-home"
            ]
        );
    }

    #[test]
    fn test_failure_does_not_stop_sweep() {
        let store = MockStore::default();
        store.fail_create_for("/home", "Permission denied");
        let executor = BackupExecutor::new(&store, "/");

        let result = executor.execute(&job(&["/etc", "/home", "/srv"]));

        assert!(!result.succeeded());
        let failed: Vec<_> = result.failed().map(|t| t.directory.clone()).collect();
        assert_eq!(failed, vec![PathBuf::from("/home")]);
        assert!(result.targets[1]
            .error
            .as_deref()
            .unwrap()
            .contains("Permission denied"));

        // The target after the failure was still attempted.
        let creates = store
            .calls()
            .into_iter()
            .filter(|c| matches!(c, StoreCall::Create { .. }))
            .count();
        assert_eq!(creates, 3);
        assert_eq!(store.archives().len(), 2);
    }
}
