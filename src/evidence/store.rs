use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{DailyCount, EvidenceRecord, EvidenceStore, ReviewStatus};
use crate::detect::Category;

pub struct SqliteEvidenceStore {
    conn: Mutex<Connection>,
}

impl SqliteEvidenceStore {
    /// Open (creating if needed) the store at `db_path`. `file:` URIs are accepted.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = crate::open_db_connection(db_path)
            .with_context(|| format!("open evidence db {}", db_path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("evidence db connection lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS evidence (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              category TEXT NOT NULL,
              confidence REAL NOT NULL,
              created_ms INTEGER NOT NULL,
              timestamp TEXT NOT NULL,
              snapshot_path TEXT NOT NULL,
              review_status TEXT NOT NULL DEFAULT 'new'
            );

            CREATE INDEX IF NOT EXISTS idx_evidence_created ON evidence(created_ms);
            "#,
        )?;
        Ok(())
    }
}

const RECORD_COLUMNS: &str =
    "id, category, confidence, created_ms, snapshot_path, review_status";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, f64, i64, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_record(raw: (i64, String, f64, i64, String, String)) -> Result<EvidenceRecord> {
    let (id, category, confidence, created_ms, snapshot_path, review) = raw;
    let timestamp = Utc
        .timestamp_millis_opt(created_ms)
        .single()
        .ok_or_else(|| anyhow!("corrupt evidence row {}: created_ms {}", id, created_ms))?;
    Ok(EvidenceRecord {
        id,
        category: Category::new(category),
        confidence: confidence as f32,
        timestamp,
        snapshot_path,
        review: review.parse()?,
    })
}

impl EvidenceStore for SqliteEvidenceStore {
    fn create(
        &self,
        category: &Category,
        confidence: f32,
        timestamp: DateTime<Utc>,
        snapshot_path: &str,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO evidence(category, confidence, created_ms, timestamp, snapshot_path, review_status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                category.as_str(),
                f64::from(confidence),
                timestamp.timestamp_millis(),
                timestamp.to_rfc3339(),
                snapshot_path,
                ReviewStatus::New.as_str()
            ],
        )
        .context("insert evidence record")?;
        Ok(conn.last_insert_rowid())
    }

    fn find_latest(&self) -> Result<Option<EvidenceRecord>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM evidence ORDER BY created_ms DESC, id DESC LIMIT 1",
                    RECORD_COLUMNS
                ),
                [],
                record_from_row,
            )
            .optional()?;
        raw.map(into_record).transpose()
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<EvidenceRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM evidence ORDER BY created_ms DESC, id DESC LIMIT ?1",
            RECORD_COLUMNS
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = stmt.query(params![limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(into_record(record_from_row(row)?)?);
        }
        Ok(out)
    }

    fn daily_counts(&self, since: DateTime<Utc>) -> Result<Vec<DailyCount>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT date(created_ms / 1000, 'unixepoch') AS day, category, COUNT(*)
            FROM evidence
            WHERE created_ms >= ?1
            GROUP BY day, category
            ORDER BY day ASC, category ASC
            "#,
        )?;
        let mut rows = stmt.query(params![since.timestamp_millis()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let count: i64 = row.get(2)?;
            out.push(DailyCount {
                day: row.get(0)?,
                category: row.get(1)?,
                count: count.max(0) as u64,
            });
        }
        Ok(out)
    }

    fn set_review_status(&self, id: i64, status: ReviewStatus) -> Result<bool> {
        let changed = self.conn()?.execute(
            "UPDATE evidence SET review_status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(changed > 0)
    }
}

/// In-memory twin of `SqliteEvidenceStore`, for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryEvidenceStore {
    records: Mutex<Vec<EvidenceRecord>>,
}

impl InMemoryEvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<MutexGuard<'_, Vec<EvidenceRecord>>> {
        self.records
            .lock()
            .map_err(|_| anyhow!("in-memory evidence lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.records().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn newest_first(records: &[EvidenceRecord]) -> Vec<EvidenceRecord> {
    let mut sorted = records.to_vec();
    sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
    sorted
}

impl EvidenceStore for InMemoryEvidenceStore {
    fn create(
        &self,
        category: &Category,
        confidence: f32,
        timestamp: DateTime<Utc>,
        snapshot_path: &str,
    ) -> Result<i64> {
        let mut records = self.records()?;
        let id = records.last().map(|r| r.id + 1).unwrap_or(1);
        records.push(EvidenceRecord {
            id,
            category: category.clone(),
            confidence,
            timestamp,
            snapshot_path: snapshot_path.to_string(),
            review: ReviewStatus::New,
        });
        Ok(id)
    }

    fn find_latest(&self) -> Result<Option<EvidenceRecord>> {
        Ok(newest_first(&self.records()?).into_iter().next())
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<EvidenceRecord>> {
        Ok(newest_first(&self.records()?)
            .into_iter()
            .take(limit)
            .collect())
    }

    fn daily_counts(&self, since: DateTime<Utc>) -> Result<Vec<DailyCount>> {
        let mut counts: BTreeMap<(String, String), u64> = BTreeMap::new();
        for record in self.records()?.iter().filter(|r| r.timestamp >= since) {
            let day = record.timestamp.format("%Y-%m-%d").to_string();
            *counts
                .entry((day, record.category.as_str().to_string()))
                .or_insert(0) += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((day, category), count)| DailyCount {
                day,
                category,
                count,
            })
            .collect())
    }

    fn set_review_status(&self, id: i64, status: ReviewStatus) -> Result<bool> {
        let mut records = self.records()?;
        match records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.review = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn exercise(store: &dyn EvidenceStore) {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 50).unwrap();
        assert!(store.find_latest().unwrap().is_none());

        let firearm = Category::new("firearm");
        let blade = Category::new("blade");
        let first = store.create(&firearm, 0.8, base, "firearm_1.jpg").unwrap();
        let second = store
            .create(&blade, 0.6, base + Duration::seconds(20), "blade_2.jpg")
            .unwrap();
        store
            .create(&firearm, 0.9, base + Duration::seconds(30), "firearm_3.jpg")
            .unwrap();

        let latest = store.find_latest().unwrap().unwrap();
        assert_eq!(latest.snapshot_path, "firearm_3.jpg");
        assert_eq!(latest.review, ReviewStatus::New);

        let recent = store.list_recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].id, second);
        assert!((recent[1].confidence - 0.6).abs() < 1e-6);

        let counts = store.daily_counts(base - Duration::days(1)).unwrap();
        assert_eq!(
            counts,
            vec![
                DailyCount {
                    day: "2024-03-01".into(),
                    category: "firearm".into(),
                    count: 1
                },
                DailyCount {
                    day: "2024-03-02".into(),
                    category: "blade".into(),
                    count: 1
                },
                DailyCount {
                    day: "2024-03-02".into(),
                    category: "firearm".into(),
                    count: 1
                },
            ]
        );
        assert!(store
            .daily_counts(base + Duration::seconds(25))
            .unwrap()
            .iter()
            .all(|c| c.category == "firearm"));

        assert!(store.set_review_status(first, ReviewStatus::False).unwrap());
        assert!(!store.set_review_status(9999, ReviewStatus::Valid).unwrap());
        let oldest = store.list_recent(10).unwrap().pop().unwrap();
        assert_eq!(oldest.review, ReviewStatus::False);
    }

    #[test]
    fn in_memory_store_behaves_like_sqlite() {
        exercise(&InMemoryEvidenceStore::new());
    }

    #[test]
    fn sqlite_store_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evidence.db");
        exercise(&SqliteEvidenceStore::open(path.to_str().unwrap()).unwrap());
    }

    #[test]
    fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evidence.db");
        let path = path.to_str().unwrap();
        let now = Utc::now();
        {
            let store = SqliteEvidenceStore::open(path).unwrap();
            store
                .create(&Category::new("blade"), 0.7, now, "blade_1.jpg")
                .unwrap();
        }
        let store = SqliteEvidenceStore::open(path).unwrap();
        let latest = store.find_latest().unwrap().unwrap();
        assert_eq!(latest.category, Category::new("blade"));
        assert_eq!(latest.timestamp.timestamp_millis(), now.timestamp_millis());
    }
}
