//! Backup tier classification.
//!
//! A run is `yearly` until the host has a yearly archive for the current
//! calendar year, then `monthly` until it has one for the current month, and
//! `daily` otherwise.

use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::catalog::Catalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Yearly,
    Monthly,
    Daily,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Yearly, Tier::Monthly, Tier::Daily];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Yearly => "yearly",
            Tier::Monthly => "monthly",
            Tier::Daily => "daily",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yearly" => Ok(Tier::Yearly),
            "monthly" => Ok(Tier::Monthly),
            "daily" => Ok(Tier::Daily),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

/// Decide which tier of backup is due for `host` at `now`.
pub fn select(catalog: &Catalog, host: &str, now: NaiveDateTime) -> Tier {
    let has_yearly = catalog
        .for_host_tier(host, Tier::Yearly)
        .any(|a| a.timestamp().year() == now.year());
    if !has_yearly {
        return Tier::Yearly;
    }

    let has_monthly = catalog
        .for_host_tier(host, Tier::Monthly)
        .any(|a| a.timestamp().year() == now.year() && a.timestamp().month() == now.month());
    if !has_monthly {
        return Tier::Monthly;
    }

    Tier::Daily
}
