//! Outbound alert dispatch.
//!
//! Notifications are queued onto a bounded channel and delivered by one
//! background worker, so a slow or dead endpoint never holds up the capture
//! loop. A full queue drops the alert; failures are logged and swallowed.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::detect::Category;
use crate::error::PipelineError;

/// What an alert says.
#[derive(Clone, Debug, PartialEq)]
pub struct Alert {
    /// Resolvable URL of the snapshot; `None` when it could not be stored.
    pub image_url: Option<String>,
    pub category: Category,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn message(&self) -> String {
        format!("{} detected ({:.2})", self.category, self.confidence)
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, alert: &Alert) -> Result<(), PipelineError>;
}

/// Payload field names expected by the receiving endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldMapping {
    pub image: String,
    pub message: String,
    pub time: String,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            image: "image_url".to_string(),
            message: "message".to_string(),
            time: "timestamp".to_string(),
        }
    }
}

/// POSTs a small JSON document per alert.
pub struct HttpNotifier {
    endpoint: String,
    fields: FieldMapping,
    agent: ureq::Agent,
}

impl HttpNotifier {
    pub fn new(endpoint: impl Into<String>, fields: FieldMapping, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            endpoint: endpoint.into(),
            fields,
            agent,
        }
    }

    /// The image field is left out when the alert has no snapshot.
    pub fn payload(&self, alert: &Alert) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        if let Some(url) = &alert.image_url {
            body.insert(self.fields.image.clone(), serde_json::Value::String(url.clone()));
        }
        body.insert(
            self.fields.message.clone(),
            serde_json::Value::String(alert.message()),
        );
        body.insert(
            self.fields.time.clone(),
            serde_json::Value::String(alert.timestamp.to_rfc3339()),
        );
        serde_json::Value::Object(body)
    }
}

impl Notifier for HttpNotifier {
    fn notify(&self, alert: &Alert) -> Result<(), PipelineError> {
        match self.agent.post(&self.endpoint).send_json(self.payload(alert)) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => Err(PipelineError::NotifyError(format!(
                "{} answered HTTP {}",
                self.endpoint, code
            ))),
            Err(err) => Err(PipelineError::NotifyError(format!(
                "{}: {}",
                self.endpoint, err
            ))),
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    pub sent: AtomicU64,
    pub failed: AtomicU64,
    pub dropped: AtomicU64,
}

/// Fire-and-forget front for a `Notifier`.
pub struct NotifyDispatcher {
    tx: Option<Sender<Alert>>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<DispatchStats>,
}

impl NotifyDispatcher {
    pub fn spawn(notifier: Box<dyn Notifier>, queue_depth: usize) -> Result<Self> {
        let (tx, rx) = bounded::<Alert>(queue_depth.max(1));
        let stats = Arc::new(DispatchStats::default());
        let worker_stats = Arc::clone(&stats);
        let worker = std::thread::Builder::new()
            .name("watchpost-notify".to_string())
            .spawn(move || run_worker(notifier, rx, worker_stats))
            .map_err(|e| anyhow!("spawn notify worker: {}", e))?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            stats,
        })
    }

    /// Dispatcher that accepts and discards alerts.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            worker: None,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Queue an alert without blocking. Returns false when it was dropped.
    pub fn dispatch(&self, alert: Alert) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(alert) {
            Ok(()) => true,
            Err(TrySendError::Full(alert)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("notify queue full; dropping alert for {}", alert.category);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("notify worker gone; alert dropped");
                false
            }
        }
    }

    /// Drain queued alerts and stop the worker.
    pub fn shutdown(&mut self) {
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("notify worker panicked");
            }
        }
    }
}

impl Drop for NotifyDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(notifier: Box<dyn Notifier>, rx: Receiver<Alert>, stats: Arc<DispatchStats>) {
    for alert in rx.iter() {
        match notifier.notify(&alert) {
            Ok(()) => {
                stats.sent.fetch_add(1, Ordering::Relaxed);
                log::info!("alert sent: {}", alert.message());
            }
            Err(err) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("{}", err);
            }
        }
    }
}
