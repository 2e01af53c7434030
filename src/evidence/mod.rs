//! Evidence records and their storage boundary.
//!
//! - `EvidenceStore`: create / find_latest / list_recent, plus the daily trend
//!   and review-status operations used by the API and operator CLI.
//! - `SqliteEvidenceStore` and `InMemoryEvidenceStore` implement it.
//! - `EvidencePersister` writes the snapshot artifact and then the record.

mod persister;
mod store;

pub use persister::{snapshot_file_name, EvidencePersister};
pub use store::{InMemoryEvidenceStore, SqliteEvidenceStore};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::detect::Category;

/// Operator review outcome. The pipeline only ever writes `New`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    #[default]
    New,
    Valid,
    False,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::New => "new",
            ReviewStatus::Valid => "valid",
            ReviewStatus::False => "false",
        }
    }
}

impl FromStr for ReviewStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(ReviewStatus::New),
            "valid" | "reviewed" => Ok(ReviewStatus::Valid),
            "false" | "false_positive" => Ok(ReviewStatus::False),
            other => Err(anyhow!("unknown review status '{}'", other)),
        }
    }
}

/// One persisted detection episode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: i64,
    pub category: Category,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
    /// Snapshot file name relative to the snapshot root.
    pub snapshot_path: String,
    pub review: ReviewStatus,
}

/// Per-day, per-category record count.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCount {
    /// `YYYY-MM-DD`, UTC.
    pub day: String,
    pub category: String,
    pub count: u64,
}

pub trait EvidenceStore: Send + Sync {
    fn create(
        &self,
        category: &Category,
        confidence: f32,
        timestamp: DateTime<Utc>,
        snapshot_path: &str,
    ) -> Result<i64>;

    fn find_latest(&self) -> Result<Option<EvidenceRecord>>;

    /// Newest first.
    fn list_recent(&self, limit: usize) -> Result<Vec<EvidenceRecord>>;

    /// Counts for records at or after `since`, ordered by day then category.
    fn daily_counts(&self, since: DateTime<Utc>) -> Result<Vec<DailyCount>>;

    /// Returns false when no record has `id`.
    fn set_review_status(&self, id: i64, status: ReviewStatus) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_status_parses_aliases() {
        assert_eq!("Valid".parse::<ReviewStatus>().unwrap(), ReviewStatus::Valid);
        assert_eq!("reviewed".parse::<ReviewStatus>().unwrap(), ReviewStatus::Valid);
        assert_eq!("false".parse::<ReviewStatus>().unwrap(), ReviewStatus::False);
        assert!("maybe".parse::<ReviewStatus>().is_err());
    }
}
