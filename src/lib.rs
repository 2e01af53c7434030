//! Watchpost
//!
//! Single-camera weapon detection pipeline.
//!
//! # Architecture
//!
//! One capture loop owns the camera. Every frame flows through:
//!
//! 1. **Ingest**: an exclusive `CaptureHandle` (primary device, then one fallback).
//! 2. **Scheduling**: the detector runs on every `(skip_count + 1)`-th frame; the
//!    frames in between reuse the last annotation.
//! 3. **Gating**: monitored detections pass a per-category cooldown before any
//!    evidence is written or alert sent.
//! 4. **Evidence**: a JPEG snapshot plus one record in the evidence store.
//! 5. **Alerts**: best-effort HTTP notification from a background queue.
//! 6. **Streaming**: the display image is JPEG-encoded and fanned out to every
//!    MJPEG subscriber.
//!
//! # Module Structure
//!
//! - `frame`, `ingest`: captured rasters and the device handle
//! - `detect`, `annotate`, `scheduler`: inference and display
//! - `gate`, `evidence`, `notify`: the alerting path
//! - `encode`, `broadcast`, `api`: the streaming and query surface
//! - `status`: ALERT / OK / IDLE / ERROR classification
//! - `pipeline`: the loop tying it together

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};

pub mod annotate;
pub mod api;
pub mod broadcast;
pub mod config;
pub mod detect;
pub mod encode;
pub mod error;
pub mod evidence;
pub mod frame;
pub mod gate;
pub mod ingest;
pub mod notify;
pub mod pipeline;
pub mod scheduler;
pub mod status;

pub use broadcast::{FrameBroadcaster, Received, Subscription};
pub use config::WatchpostConfig;
pub use detect::{Category, CategoryClassifier, Detection, DetectorBackend};
pub use error::PipelineError;
pub use evidence::{
    EvidencePersister, EvidenceRecord, EvidenceStore, InMemoryEvidenceStore, ReviewStatus,
    SqliteEvidenceStore,
};
pub use frame::Frame;
pub use gate::{AlertCooldownGate, GateScope};
pub use ingest::{open_capture, open_configured, CaptureHandle, CaptureSettings, FrameSource};
#[cfg(feature = "ingest-v4l2")]
pub use ingest::{v4l2::V4l2Config, V4l2Source};
pub use notify::{Alert, HttpNotifier, Notifier, NotifyDispatcher};
pub use pipeline::{Pipeline, PipelineHandle, PipelineParts, PipelineSettings};
pub use scheduler::{CycleMode, DetectionScheduler};
pub use status::{StatusLevel, StatusQuery, StatusReport};

/// Private shared-cache in-memory SQLite URI, unique per call.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:watchpost_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}
