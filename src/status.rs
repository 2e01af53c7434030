//! Latest-status classification for dashboards.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::detect::CategoryClassifier;
use crate::evidence::EvidenceStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusLevel {
    Alert,
    Ok,
    Idle,
    Error,
}

impl StatusLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusLevel::Alert => "ALERT",
            StatusLevel::Ok => "OK",
            StatusLevel::Idle => "IDLE",
            StatusLevel::Error => "ERROR",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusReport {
    pub level: StatusLevel,
    pub message: String,
    /// Confidence of the record the level was derived from; 0 when none.
    pub confidence: f32,
}

pub struct StatusQuery {
    store: Arc<dyn EvidenceStore>,
    classifier: CategoryClassifier,
    alert_window: Duration,
}

impl StatusQuery {
    pub fn new(
        store: Arc<dyn EvidenceStore>,
        classifier: CategoryClassifier,
        alert_window: Duration,
    ) -> Self {
        Self {
            store,
            classifier,
            alert_window,
        }
    }

    /// Never fails: storage errors become `ERROR` and are logged here.
    pub fn latest_status(&self, now: DateTime<Utc>) -> StatusReport {
        let record = match self.store.find_latest() {
            Ok(Some(record)) => record,
            Ok(None) => {
                return StatusReport {
                    level: StatusLevel::Idle,
                    message: "No events recorded".to_string(),
                    confidence: 0.0,
                }
            }
            Err(err) => {
                log::warn!("status query failed: {:#}", err);
                return StatusReport {
                    level: StatusLevel::Error,
                    message: "Event store unavailable".to_string(),
                    confidence: 0.0,
                };
            }
        };

        let age = now.signed_duration_since(record.timestamp);
        let within_window = age
            .to_std()
            .map(|age| age < self.alert_window)
            .unwrap_or(true);
        let age_secs = age.num_seconds().max(0);

        if within_window && self.classifier.is_monitored(record.category.as_str()) {
            StatusReport {
                level: StatusLevel::Alert,
                message: format!(
                    "{} detected {}s ago ({:.2})",
                    record.category.as_str().to_uppercase(),
                    age_secs,
                    record.confidence
                ),
                confidence: record.confidence,
            }
        } else {
            StatusReport {
                level: StatusLevel::Ok,
                message: format!(
                    "No active alerts. Last event: {} at {}",
                    record.category,
                    record.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
                ),
                confidence: record.confidence,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Category;
    use crate::evidence::{DailyCount, EvidenceRecord, InMemoryEvidenceStore, ReviewStatus};
    use anyhow::{anyhow, Result};

    fn classifier() -> CategoryClassifier {
        CategoryClassifier::new(&[("firearm".to_string(), vec!["gun".into()])]).unwrap()
    }

    fn query(store: Arc<dyn EvidenceStore>) -> StatusQuery {
        StatusQuery::new(store, classifier(), Duration::from_secs(30))
    }

    #[test]
    fn recent_monitored_record_is_alert_and_stale_is_ok() {
        let store = Arc::new(InMemoryEvidenceStore::new());
        let now = Utc::now();
        store
            .create(
                &Category::new("firearm"),
                0.8,
                now - chrono::Duration::seconds(10),
                "firearm_1.jpg",
            )
            .unwrap();
        let q = query(store);
        let fresh = q.latest_status(now);
        assert_eq!(fresh.level, StatusLevel::Alert);
        assert!((fresh.confidence - 0.8).abs() < 1e-6);

        let later = q.latest_status(now + chrono::Duration::seconds(50));
        assert_eq!(later.level, StatusLevel::Ok);
    }

    #[test]
    fn unmonitored_record_is_ok() {
        let store = Arc::new(InMemoryEvidenceStore::new());
        let now = Utc::now();
        store
            .create(&Category::new("motion"), 0.9, now, "motion_1.jpg")
            .unwrap();
        assert_eq!(query(store).latest_status(now).level, StatusLevel::Ok);
    }

    #[test]
    fn empty_store_is_idle() {
        let report = query(Arc::new(InMemoryEvidenceStore::new())).latest_status(Utc::now());
        assert_eq!(report.level, StatusLevel::Idle);
        assert_eq!(report.confidence, 0.0);
    }

    struct Broken;

    impl EvidenceStore for Broken {
        fn create(&self, _: &Category, _: f32, _: DateTime<Utc>, _: &str) -> Result<i64> {
            Err(anyhow!("disk gone"))
        }
        fn find_latest(&self) -> Result<Option<EvidenceRecord>> {
            Err(anyhow!("disk gone"))
        }
        fn list_recent(&self, _: usize) -> Result<Vec<EvidenceRecord>> {
            Err(anyhow!("disk gone"))
        }
        fn daily_counts(&self, _: DateTime<Utc>) -> Result<Vec<DailyCount>> {
            Err(anyhow!("disk gone"))
        }
        fn set_review_status(&self, _: i64, _: ReviewStatus) -> Result<bool> {
            Err(anyhow!("disk gone"))
        }
    }

    #[test]
    fn store_failure_is_error_level_without_details() {
        let report = query(Arc::new(Broken)).latest_status(Utc::now());
        assert_eq!(report.level, StatusLevel::Error);
        assert!(!report.message.contains("disk gone"));
    }

    #[test]
    fn report_serializes_uppercase_level() {
        let report = StatusReport {
            level: StatusLevel::Alert,
            message: "x".into(),
            confidence: 0.5,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["level"], "ALERT");
    }
}
