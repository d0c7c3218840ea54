//! Run controller - one rotation run from catalog to pruning.
//!
//! Phases, in order:
//!
//! | # | Phase    | On failure                                         |
//! |---|----------|----------------------------------------------------|
//! | 1 | Catalog  | abort                                              |
//! | 2 | Tier     | (pure, cannot fail)                                |
//! | 3 | Pre-hook | abort                                              |
//! | 4 | Backup   | record per target, continue with the next target   |
//! | 5 | Post-hook| abort, pruning skipped                             |
//! | 6 | Catalog  | abort (refresh so new archives count toward keep)  |
//! | 7 | Prune    | log per archive, continue                          |
//!
//! Pruning only happens when every target in phase 4 succeeded.
//!
//! The caller is responsible for holding the run lock; see [`run_locked`]
//! for the variant that takes it itself and reacts to interruption.

use chrono::NaiveDateTime;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::catalog::{Batch, Catalog};
use crate::config::Config;
use crate::daemon::lock::LockGuard;
use crate::daemon::ShutdownSignal;
use crate::executor::{BackupExecutor, BackupJob, TargetResult};
use crate::hooks::{self, HookStage};
use crate::retention::{self, PruneReport, Pruner};
use crate::store::ArchiveStore;
use crate::tier::{self, Tier};
use crate::utils::errors::{Result, RotateError};

/// Tiers that have a retention limit, in pruning order.
const PRUNED_TIERS: [Tier; 2] = [Tier::Monthly, Tier::Daily];

/// State threaded through the phases of one run.
struct RunContext {
    run_id: Uuid,
    now: NaiveDateTime,
    catalog: Catalog,
    tier: Tier,
    backups_ok: bool,
}

/// Everything a finished run did.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub tier: Tier,
    pub targets: Vec<TargetResult>,
    pub pruned: Vec<PruneReport>,
    /// True when pruning was vetoed by a failed backup.
    pub pruning_skipped: bool,
    /// Catalog names that did not follow the naming convention.
    pub rejected: Vec<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.targets.iter().all(TargetResult::succeeded)
    }

    pub fn deleted(&self) -> impl Iterator<Item = &str> {
        self.pruned
            .iter()
            .flat_map(|p| p.deleted.iter().map(String::as_str))
    }

    pub fn delete_failures(&self) -> usize {
        self.pruned.iter().map(|p| p.failed.len()).sum()
    }
}

/// What a run would do right now, without creating or deleting anything.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub tier: Tier,
    pub archives: Vec<String>,
    pub expired: Vec<Batch>,
}

pub struct Controller {
    config: Config,
    store: Arc<dyn ArchiveStore>,
}

impl Controller {
    pub fn new(config: Config, store: Arc<dyn ArchiveStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Execute one rotation run at `now` (already in the configured timezone).
    pub fn run(&self, now: NaiveDateTime) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, host = %self.config.host);
        let _enter = span.enter();

        let catalog = Catalog::fetch(self.store.as_ref())?;
        let tier = tier::select(&catalog, &self.config.host, now);
        info!(
            event = "tier_selected",
            tier = %tier,
            archives = catalog.len(),
            "Selected backup tier"
        );

        let mut ctx = RunContext {
            run_id,
            now,
            catalog,
            tier,
            backups_ok: false,
        };

        self.run_hook(HookStage::PreBackup, &ctx)?;
        let targets = self.backup(&mut ctx);
        self.run_hook(HookStage::PostBackup, &ctx)?;

        let (pruned, pruning_skipped) = if ctx.backups_ok {
            (self.prune(&mut ctx)?, false)
        } else {
            warn!(
                event = "prune_skipped",
                tier = %ctx.tier,
                "Skipping pruning because at least one backup failed"
            );
            (Vec::new(), true)
        };
        // From the latest listing, which is the refreshed one when pruning ran.
        let rejected = ctx.catalog.rejected().to_vec();

        Ok(RunReport {
            run_id: ctx.run_id,
            tier: ctx.tier,
            targets,
            pruned,
            pruning_skipped,
            rejected,
        })
    }

    /// Work out the tier, archive names and expired batches for a run at `now`.
    pub fn plan(&self, now: NaiveDateTime) -> Result<RunPlan> {
        let catalog = Catalog::fetch(self.store.as_ref())?;
        let tier = tier::select(&catalog, &self.config.host, now);
        let job = self.job(tier, now);
        let new_archives = job.archive_names();

        let after_backup = catalog.with_archives(new_archives.iter().cloned());
        let expired = PRUNED_TIERS
            .iter()
            .filter_map(|t| {
                self.config.retention.keep_for(*t).map(|keep| {
                    retention::expired_batches(&after_backup, &self.config.host, *t, keep)
                })
            })
            .flatten()
            .collect();

        Ok(RunPlan {
            tier,
            archives: new_archives.iter().map(|n| n.to_string()).collect(),
            expired,
        })
    }

    /// The current catalog, for listing.
    pub fn catalog(&self) -> Result<Catalog> {
        Catalog::fetch(self.store.as_ref())
    }

    fn job(&self, tier: Tier, now: NaiveDateTime) -> BackupJob {
        BackupJob {
            host: self.config.host.clone(),
            tier,
            timestamp: now,
            targets: self.config.backup.targets.clone(),
        }
    }

    fn backup(&self, ctx: &mut RunContext) -> Vec<TargetResult> {
        let executor = BackupExecutor::new(self.store.as_ref(), &self.config.backup.source_root);
        let result = executor.execute(&self.job(ctx.tier, ctx.now));
        ctx.backups_ok = result.succeeded();

        let failed = result.failed().count();
        if failed == 0 {
            info!(
                event = "backup_complete",
                tier = %ctx.tier,
                targets = result.targets.len(),
                duration_ms = result.duration.as_millis() as u64,
                "All targets backed up"
            );
        } else {
            error!(
                event = "backup_incomplete",
                tier = %ctx.tier,
                targets = result.targets.len(),
                failed,
                duration_ms = result.duration.as_millis() as u64,
                "Some targets failed to back up"
            );
        }

        result.targets
    }

    fn prune(&self, ctx: &mut RunContext) -> Result<Vec<PruneReport>> {
        ctx.catalog = Catalog::fetch(self.store.as_ref())?;
        let pruner = Pruner::new(self.store.as_ref());

        Ok(PRUNED_TIERS
            .iter()
            .filter_map(|t| {
                self.config
                    .retention
                    .keep_for(*t)
                    .map(|keep| pruner.prune(&ctx.catalog, &self.config.host, *t, keep))
            })
            .collect())
    }

    fn run_hook(&self, stage: HookStage, ctx: &RunContext) -> Result<()> {
        let path = match stage {
            HookStage::PreBackup => self.config.hooks.pre_backup.as_deref(),
            HookStage::PostBackup => self.config.hooks.post_backup.as_deref(),
        };
        let Some(path) = path else {
            return Ok(());
        };

        let run_id = ctx.run_id.to_string();
        let mut env = vec![
            ("BACKUP_ROTATE_HOST", self.config.host.as_str()),
            ("BACKUP_ROTATE_TIER", ctx.tier.as_str()),
            ("BACKUP_ROTATE_RUN_ID", run_id.as_str()),
        ];
        if stage == HookStage::PostBackup {
            env.push((
                "BACKUP_ROTATE_STATUS",
                if ctx.backups_ok { "ok" } else { "failed" },
            ));
        }

        hooks::run(stage, path, &env)
    }
}

/// Take the run lock at `lock_path` and run on a blocking thread until the
/// run finishes or `interrupted` resolves.
///
/// On interruption the lock is released, the store is told to stop its
/// in-flight call and [`RotateError::Interrupted`] is returned. The blocking
/// run is left to wind down on its own; a hook script that is running at
/// that moment is not stopped and may outlive the lock.
pub async fn run_locked<F>(
    controller: Controller,
    lock_path: &Path,
    now: NaiveDateTime,
    interrupted: F,
) -> Result<RunReport>
where
    F: Future<Output = ShutdownSignal>,
{
    let mut guard = LockGuard::acquire(lock_path)?;
    let store = Arc::clone(&controller.store);
    let handle = tokio::task::spawn_blocking(move || controller.run(now));

    tokio::select! {
        joined = handle => {
            let report = joined.map_err(|e| RotateError::Task(e.to_string()))?;
            guard.release()?;
            report
        }
        signal = interrupted => {
            drop(guard);
            store.cancel();
            Err(RotateError::Interrupted(signal.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::name::TIMESTAMP_FORMAT;
    use crate::config::{BackupConfig, StoreConfig};
    use crate::daemon::lock::is_process_alive;
    use crate::store::mock::{MockStore, StoreCall};
    use crate::store::BorgStore;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).unwrap()
    }

    fn config() -> Config {
        Config {
            host: "h".into(),
            backup: BackupConfig {
                targets: vec![PathBuf::from("/etc"), PathBuf::from("/var")],
                ..BackupConfig::default()
            },
            ..Config::default()
        }
    }

    fn controller(config: Config, store: &Arc<MockStore>) -> Controller {
        Controller::new(config, store.clone())
    }

    /// A full daily history: yearly + monthly present and `days` daily batches in March 2024.
    fn history(days: u32) -> Vec<String> {
        let mut names = vec![
            "h-yearly-2024-01-01_02:00:00-etc".to_string(),
            "h-monthly-2024-03-01_02:00:00-etc".to_string(),
        ];
        for d in 0..days {
            // Daily batches on consecutive days going back from 2024-03-14.
            let date = at("2024-03-14_02:00:00") - chrono::Duration::days(d as i64);
            for t in ["etc", "var"] {
                names.push(format!("h-daily-{}-{t}", date.format(TIMESTAMP_FORMAT)));
            }
        }
        names
    }

    #[test]
    fn test_first_run_is_yearly() {
        let store = Arc::new(MockStore::default());
        let report = controller(config(), &store).run(at("2024-03-15_02:00:00")).unwrap();

        assert_eq!(report.tier, Tier::Yearly);
        assert!(report.succeeded());
        assert!(!report.pruning_skipped);
        assert_eq!(
            store.archives(),
            vec![
                "h-yearly-2024-03-15_02:00:00-etc",
                "h-yearly-2024-03-15_02:00:00-var"
            ]
        );
    }

    #[test]
    fn test_consecutive_runs_walk_tiers() {
        let store = Arc::new(MockStore::with_archives(["h-yearly-2024-01-01_02:00:00-etc"]));
        let c = controller(config(), &store);

        assert_eq!(c.run(at("2024-03-15_02:00:00")).unwrap().tier, Tier::Monthly);
        assert_eq!(c.run(at("2024-03-16_02:00:00")).unwrap().tier, Tier::Daily);
        assert_eq!(c.run(at("2025-01-01_02:00:00")).unwrap().tier, Tier::Yearly);
    }

    #[test]
    fn test_run_prunes_with_refreshed_catalog() {
        // 31 daily batches already; today's run makes 32, so the oldest goes.
        let store = Arc::new(MockStore::with_archives(history(31)));
        let report = controller(config(), &store).run(at("2024-03-15_02:00:00")).unwrap();

        assert_eq!(report.tier, Tier::Daily);
        let deleted: Vec<_> = report.deleted().collect();
        assert_eq!(
            deleted,
            vec![
                "h-daily-2024-02-13_02:00:00-etc",
                "h-daily-2024-02-13_02:00:00-var"
            ]
        );
        // Catalog listed once before the backup and once before pruning.
        assert_eq!(store.list_calls(), 2);
    }

    #[test]
    fn test_failed_backup_vetoes_pruning() {
        let store = Arc::new(MockStore::with_archives(history(40)));
        store.fail_create_for("/var", "Connection closed by remote host");
        let report = controller(config(), &store).run(at("2024-03-15_02:00:00")).unwrap();

        assert!(!report.succeeded());
        assert!(report.pruning_skipped);
        assert!(report.pruned.is_empty());
        assert!(store.deleted().is_empty());
        // The catalog is not refreshed either.
        assert_eq!(store.list_calls(), 1);
        // The good target was still archived.
        assert!(store
            .archives()
            .contains(&"h-daily-2024-03-15_02:00:00-etc".to_string()));
    }

    #[test]
    fn test_catalog_failure_aborts_before_backup() {
        let store = Arc::new(MockStore::default());
        store.fail_list("Remote: Permission denied (publickey)");

        let err = controller(config(), &store).run(at("2024-03-15_02:00:00")).unwrap_err();
        assert!(matches!(err, RotateError::Store { op: "list", .. }));
        assert_eq!(store.calls(), vec![StoreCall::List]);
    }

    #[test]
    fn test_pre_hook_failure_aborts_before_backup() {
        let temp = TempDir::new().unwrap();
        let hook = temp.path().join("pre.sh");
        fs::write(&hook, "#!/bin/sh\nexit 1\n").unwrap();
        fs::set_permissions(&hook, fs::Permissions::from_mode(0o755)).unwrap();

        let mut cfg = config();
        cfg.hooks.pre_backup = Some(hook);
        let store = Arc::new(MockStore::default());

        let err = controller(cfg, &store).run(at("2024-03-15_02:00:00")).unwrap_err();
        assert!(matches!(err, RotateError::HookScript(_)));
        assert!(store.archives().is_empty());
    }

    #[test]
    fn test_post_hook_sees_status_and_failure_skips_pruning() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("status");
        let hook = temp.path().join("post.sh");
        fs::write(
            &hook,
            format!(
                "#!/bin/sh\necho \"$BACKUP_ROTATE_TIER $BACKUP_ROTATE_STATUS\" > {}\nexit 1\n",
                out.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&hook, fs::Permissions::from_mode(0o755)).unwrap();

        let mut cfg = config();
        cfg.hooks.post_backup = Some(hook);
        let store = Arc::new(MockStore::with_archives(history(40)));

        let err = controller(cfg, &store).run(at("2024-03-15_02:00:00")).unwrap_err();
        assert!(matches!(err, RotateError::HookScript(_)));
        assert_eq!(fs::read_to_string(out).unwrap().trim(), "daily ok");
        assert!(store.deleted().is_empty());
    }

    #[test]
    fn test_plan_has_no_side_effects() {
        let store = Arc::new(MockStore::with_archives(history(31)));
        let plan = controller(config(), &store).plan(at("2024-03-15_02:00:00")).unwrap();

        assert_eq!(plan.tier, Tier::Daily);
        assert_eq!(
            plan.archives,
            vec![
                "h-daily-2024-03-15_02:00:00-etc",
                "h-daily-2024-03-15_02:00:00-var"
            ]
        );
        assert_eq!(plan.expired.len(), 1);
        assert_eq!(plan.expired[0].key.to_string(), "h-daily-2024-02-13");
        assert_eq!(store.calls(), vec![StoreCall::List]);
    }

    #[test]
    fn test_host_ending_in_tier_walks_tiers() {
        let mut cfg = config();
        cfg.host = "srv-yearly".into();
        let store = Arc::new(MockStore::default());
        let c = controller(cfg, &store);

        assert_eq!(c.run(at("2024-03-15_02:00:00")).unwrap().tier, Tier::Yearly);
        assert_eq!(c.run(at("2024-03-16_02:00:00")).unwrap().tier, Tier::Monthly);
        assert_eq!(c.run(at("2024-03-17_02:00:00")).unwrap().tier, Tier::Daily);
        assert!(c.catalog().unwrap().rejected().is_empty());
    }

    /// Store that gains an archive from another tool right after each listing.
    struct SharedRepository {
        inner: MockStore,
    }

    impl ArchiveStore for SharedRepository {
        fn list_archives(&self) -> Result<Vec<String>> {
            let names = self.inner.list_archives()?;
            self.inner.add_archive("manual-snapshot");
            Ok(names)
        }

        fn create_archive(&self, name: &str, source_root: &Path, path: &Path) -> Result<()> {
            self.inner.create_archive(name, source_root, path)
        }

        fn delete_archive(&self, name: &str) -> Result<()> {
            self.inner.delete_archive(name)
        }
    }

    #[test]
    fn test_rejected_names_come_from_refreshed_catalog() {
        let store = Arc::new(SharedRepository {
            inner: MockStore::with_archives(["h-yearly-2024-01-01_02:00:00-etc"]),
        });
        let report = Controller::new(config(), store).run(at("2024-03-15_02:00:00")).unwrap();

        assert!(!report.pruning_skipped);
        assert_eq!(report.rejected, vec!["manual-snapshot"]);
    }

    #[tokio::test]
    async fn test_run_locked_contention_leaves_store_untouched() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("rotate.lock");
        let _held = LockGuard::acquire(&lock_path).unwrap();

        let store = Arc::new(MockStore::default());
        let err = run_locked(
            controller(config(), &store),
            &lock_path,
            at("2024-03-15_02:00:00"),
            std::future::pending(),
        )
        .await
        .unwrap_err();

        assert!(err.is_lock_contention());
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_run_locked_releases_lock() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("rotate.lock");
        let store = Arc::new(MockStore::default());

        let report = run_locked(
            controller(config(), &store),
            &lock_path,
            at("2024-03-15_02:00:00"),
            std::future::pending(),
        )
        .await
        .unwrap();
        assert!(report.succeeded());
        assert!(!lock_path.exists());

        store.fail_list("unreachable");
        let result = run_locked(
            controller(config(), &store),
            &lock_path,
            at("2024-03-16_02:00:00"),
            std::future::pending(),
        )
        .await;
        assert!(result.is_err());
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn test_run_locked_interrupt_stops_archive_tool() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("rotate.lock");
        let pid_file = temp.path().join("tool.pid");
        let tool = temp.path().join("fake-borg");
        fs::write(
            &tool,
            format!(
                "#!/bin/sh\ncase \"$1\" in\n  create) echo $$ > {}; exec sleep 30 ;;\nesac\n",
                pid_file.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

        let store = Arc::new(BorgStore::new(&StoreConfig {
            command: tool.display().to_string(),
            ..StoreConfig::default()
        }));
        let interrupted = async {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            ShutdownSignal::Terminate
        };

        let err = run_locked(
            Controller::new(config(), store),
            &lock_path,
            at("2024-03-15_02:00:00"),
            interrupted,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RotateError::Interrupted(_)));
        assert!(!lock_path.exists());

        // The tool may not have been started yet on a slow machine.
        if let Ok(raw) = fs::read_to_string(&pid_file) {
            let pid: i32 = raw.trim().parse().unwrap();
            let started = std::time::Instant::now();
            while is_process_alive(pid) {
                assert!(
                    started.elapsed() < std::time::Duration::from_secs(5),
                    "archive tool still running"
                );
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}
