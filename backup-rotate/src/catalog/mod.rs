//! Archive catalog - a sorted, parsed view of the archive store's namespace.
//!
//! The catalog is rebuilt from a fresh listing whenever a decision needs it;
//! nothing is cached between phases of a run.

pub mod name;

use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::store::ArchiveStore;
use crate::tier::Tier;
use crate::utils::errors::Result;
pub use name::{ArchiveName, BatchKey};

/// All archives of one run: same host, tier and date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub key: BatchKey,
    pub members: Vec<ArchiveName>,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    /// Well-formed archives, ascending by name.
    archives: Vec<ArchiveName>,
    /// Names that do not follow the naming convention, ascending.
    rejected: Vec<String>,
}

impl Catalog {
    /// Fetch the catalog with exactly one listing call.
    pub fn fetch(store: &dyn ArchiveStore) -> Result<Self> {
        let started = std::time::Instant::now();
        let names = store.list_archives()?;
        let catalog = Self::from_names(names);

        for raw in &catalog.rejected {
            warn!(
                event = "catalog_malformed_name",
                archive = %raw,
                "Ignoring archive that does not match the naming convention"
            );
        }
        debug!(
            event = "catalog_listed",
            archives = catalog.archives.len(),
            rejected = catalog.rejected.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Archive catalog fetched"
        );

        Ok(catalog)
    }

    pub fn from_names(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut archives = Vec::new();
        let mut rejected = Vec::new();

        for raw in names {
            let raw: String = raw.into();
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match ArchiveName::parse(raw) {
                Ok(name) => archives.push(name),
                Err(_) => rejected.push(raw.to_string()),
            }
        }

        archives.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        archives.dedup_by(|a, b| a.as_str() == b.as_str());
        rejected.sort();
        rejected.dedup();

        Self { archives, rejected }
    }

    /// A copy of this catalog that also contains `extra`, kept sorted.
    pub fn with_archives(&self, extra: impl IntoIterator<Item = ArchiveName>) -> Self {
        let mut archives = self.archives.clone();
        archives.extend(extra);
        archives.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        archives.dedup_by(|a, b| a.as_str() == b.as_str());
        Self {
            archives,
            rejected: self.rejected.clone(),
        }
    }

    pub fn archives(&self) -> &[ArchiveName] {
        &self.archives
    }

    pub fn rejected(&self) -> &[String] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.archives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }

    pub fn for_host_tier<'a>(
        &'a self,
        host: &'a str,
        tier: Tier,
    ) -> impl Iterator<Item = &'a ArchiveName> + 'a {
        self.archives
            .iter()
            .filter(move |a| a.host() == host && a.tier() == tier)
    }

    /// Group a host's archives of one tier into batches, newest first.
    pub fn batches(&self, host: &str, tier: Tier) -> Vec<Batch> {
        let mut grouped: BTreeMap<BatchKey, Vec<ArchiveName>> = BTreeMap::new();
        for archive in self.for_host_tier(host, tier) {
            grouped
                .entry(archive.batch_key())
                .or_default()
                .push(archive.clone());
        }

        grouped
            .into_iter()
            .rev()
            .map(|(key, members)| Batch { key, members })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::MockStore;

    #[test]
    fn test_sorted_ascending_and_deterministic() {
        let names = [
            "h-daily-2024-01-03_00:00:00-etc",
            "h-yearly-2024-01-01_00:00:00-etc",
            "h-daily-2024-01-02_00:00:00-etc",
            "h-monthly-2024-01-02_00:00:00-etc",
        ];
        let mut reversed = names;
        reversed.reverse();

        let a = Catalog::from_names(names);
        let b = Catalog::from_names(reversed);
        let a_names: Vec<_> = a.archives().iter().map(|n| n.as_str()).collect();
        let b_names: Vec<_> = b.archives().iter().map(|n| n.as_str()).collect();

        assert_eq!(a_names, b_names);
        assert_eq!(
            a_names,
            vec![
                "h-daily-2024-01-02_00:00:00-etc",
                "h-daily-2024-01-03_00:00:00-etc",
                "h-monthly-2024-01-02_00:00:00-etc",
                "h-yearly-2024-01-01_00:00:00-etc",
            ]
        );
    }

    #[test]
    fn test_malformed_names_are_rejected_not_grouped() {
        let catalog = Catalog::from_names([
            "h-daily-2024-01-03_00:00:00-etc",
            "h-daily-manual",
            "",
            "  ",
        ]);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.rejected(), ["h-daily-manual"]);
    }

    #[test]
    fn test_batches_group_by_date_newest_first() {
        let catalog = Catalog::from_names([
            "host-daily-2024-01-01_00:00:01-etc",
            "host-daily-2024-01-01_00:00:02-var",
            "host-daily-2024-01-02_00:00:01-etc",
            "host-monthly-2024-01-01_00:00:01-etc",
            "other-daily-2024-01-01_00:00:01-etc",
        ]);

        let batches = catalog.batches("host", Tier::Daily);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].key.to_string(), "host-daily-2024-01-02");
        assert_eq!(batches[1].key.to_string(), "host-daily-2024-01-01");
        assert_eq!(batches[1].members.len(), 2);
    }

    #[test]
    fn test_fetch_lists_once() {
        let store = MockStore::with_archives(["h-daily-2024-01-01_00:00:00-etc", "junk"]);
        let catalog = Catalog::fetch(&store).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.rejected().len(), 1);
        assert_eq!(store.list_calls(), 1);
    }

    #[test]
    fn test_fetch_propagates_store_failure() {
        let store = MockStore::default();
        store.fail_list("connection closed by remote host");
        assert!(Catalog::fetch(&store).is_err());
    }

    #[test]
    fn test_with_archives_keeps_order() {
        let catalog = Catalog::from_names(["h-daily-2024-01-03_00:00:00-etc"]);
        let extra = ArchiveName::parse("h-daily-2024-01-02_00:00:00-etc").unwrap();
        let extended = catalog.with_archives([extra]);
        assert_eq!(extended.len(), 2);
        assert_eq!(extended.archives()[0].as_str(), "h-daily-2024-01-02_00:00:00-etc");
        assert_eq!(catalog.len(), 1);
    }
}
