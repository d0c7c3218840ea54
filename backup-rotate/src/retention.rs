//! Retention pruning.
//!
//! Archives of one tier are grouped into batches (one batch per host, tier
//! and day). The newest `keep` batches survive; every archive of the older
//! batches is deleted. Yearly archives are never pruned.

use std::time::Instant;
use tracing::{debug, error, info};

use crate::catalog::{Batch, Catalog};
use crate::store::ArchiveStore;
use crate::tier::Tier;

/// Batches of `tier` that fall outside the newest `keep`, newest first.
pub fn expired_batches(catalog: &Catalog, host: &str, tier: Tier, keep: usize) -> Vec<Batch> {
    if tier == Tier::Yearly {
        return Vec::new();
    }
    catalog.batches(host, tier).into_iter().skip(keep).collect()
}

/// Result of one pruning pass.
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub tier: Option<Tier>,
    pub kept_batches: usize,
    pub expired_batches: usize,
    pub deleted: Vec<String>,
    /// Archive name and error detail for every failed deletion.
    pub failed: Vec<(String, String)>,
}

pub struct Pruner<'a> {
    store: &'a dyn ArchiveStore,
}

impl<'a> Pruner<'a> {
    pub fn new(store: &'a dyn ArchiveStore) -> Self {
        Self { store }
    }

    /// Delete every archive of `tier` batches beyond the newest `keep`.
    ///
    /// Deletions run one by one. A failed deletion is logged and the pass
    /// continues; nothing already deleted is restored.
    pub fn prune(&self, catalog: &Catalog, host: &str, tier: Tier, keep: usize) -> PruneReport {
        let total = catalog.batches(host, tier).len();
        let expired = expired_batches(catalog, host, tier, keep);
        let mut report = PruneReport {
            tier: Some(tier),
            kept_batches: total - expired.len(),
            expired_batches: expired.len(),
            ..PruneReport::default()
        };

        if expired.is_empty() {
            debug!(event = "prune_noop", tier = %tier, batches = total, keep, "Nothing to prune");
            return report;
        }

        info!(
            event = "prune_start",
            tier = %tier,
            batches = total,
            keep,
            expired = expired.len(),
            "Pruning expired batches"
        );

        for batch in expired {
            for archive in &batch.members {
                let started = Instant::now();
                match self.store.delete_archive(archive.as_str()) {
                    Ok(()) => {
                        info!(
                            event = "prune_delete",
                            tier = %tier,
                            batch = %batch.key,
                            archive = %archive,
                            duration_ms = started.elapsed().as_millis() as u64,
                            "Archive deleted"
                        );
                        report.deleted.push(archive.as_str().to_string());
                    }
                    Err(e) => {
                        error!(
                            event = "prune_error",
                            tier = %tier,
                            batch = %batch.key,
                            archive = %archive,
                            duration_ms = started.elapsed().as_millis() as u64,
                            error = %e,
                            "Archive deletion failed"
                        );
                        report.failed.push((archive.as_str().to_string(), e.to_string()));
                    }
                }
            }
        }

        report
    }
}
