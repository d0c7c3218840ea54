//! Archive naming convention.
//!
//! Every archive is named `<host>-<tier>-<YYYY-MM-DD_HH:MM:SS>-<target>`. The
//! timestamp is fixed-width and zero-padded so names sort by creation time.

use chrono::{NaiveDate, NaiveDateTime};
use std::fmt;
use std::path::Path;

use crate::tier::Tier;
use crate::utils::errors::{Result, RotateError};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";
const TIMESTAMP_LEN: usize = 19;

/// Target name used when the target directory is the filesystem root.
const ROOT_TARGET: &str = "root";

/// A parsed archive name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveName {
    raw: String,
    host: String,
    tier: Tier,
    timestamp: NaiveDateTime,
    target: String,
}

/// Identifies one run's archives: same host, tier and creation date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchKey {
    pub host: String,
    pub tier: Tier,
    pub date: NaiveDate,
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.host, self.tier, self.date.format("%Y-%m-%d"))
    }
}

/// Derive the archive target name from a directory: path separators are stripped.
pub fn target_name(directory: &Path) -> String {
    let name: String = directory
        .to_string_lossy()
        .chars()
        .filter(|c| *c != '/')
        .collect();
    if name.is_empty() {
        ROOT_TARGET.to_string()
    } else {
        name
    }
}

impl ArchiveName {
    pub fn new(host: &str, tier: Tier, timestamp: NaiveDateTime, directory: &Path) -> Self {
        let target = target_name(directory);
        let raw = format!(
            "{}-{}-{}-{}",
            host,
            tier,
            timestamp.format(TIMESTAMP_FORMAT),
            target
        );
        Self {
            raw,
            host: host.to_string(),
            tier,
            timestamp,
            target,
        }
    }

    /// Parse a name produced by [`ArchiveName::new`].
    ///
    /// Hosts may themselves contain dashes, so every `-<tier>-` occurrence is
    /// tried left to right and the first one followed by a well-formed
    /// timestamp and a non-empty target wins. Occurrences may overlap: in
    /// `srv-daily-daily-...` the second marker shares a dash with the first.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut best: Option<(usize, Self)> = None;

        for tier in Tier::ALL {
            let marker = format!("-{}-", tier);
            let mut from = 0;
            while let Some(found) = raw[from..].find(&marker) {
                let idx = from + found;
                // The marker starts with an ASCII dash, so `idx + 1` is a char boundary.
                from = idx + 1;
                if best.as_ref().is_some_and(|(b, _)| *b <= idx) {
                    break;
                }
                if idx == 0 {
                    continue;
                }
                if let Some(parsed) = Self::parse_at(raw, idx, tier, marker.len()) {
                    best = Some((idx, parsed));
                    break;
                }
            }
        }

        best.map(|(_, name)| name)
            .ok_or_else(|| RotateError::MalformedArchiveName(raw.to_string()))
    }

    fn parse_at(raw: &str, idx: usize, tier: Tier, marker_len: usize) -> Option<Self> {
        let host = &raw[..idx];
        let rest = &raw[idx + marker_len..];

        let stamp = rest.get(..TIMESTAMP_LEN)?;
        let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
        // Reject non zero-padded variants chrono would otherwise accept.
        if timestamp.format(TIMESTAMP_FORMAT).to_string() != stamp {
            return None;
        }

        let target = rest.get(TIMESTAMP_LEN..)?.strip_prefix('-')?;
        if target.is_empty() {
            return None;
        }

        Some(Self {
            raw: raw.to_string(),
            host: host.to_string(),
            tier,
            timestamp,
            target: target.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn batch_key(&self) -> BatchKey {
        BatchKey {
            host: self.host.clone(),
            tier: self.tier,
            date: self.timestamp.date(),
        }
    }
}

impl fmt::Display for ArchiveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
