use chrono::{DateTime, Utc};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{EvidenceRecord, EvidenceStore, ReviewStatus};
use crate::detect::Category;
use crate::encode::encode_jpeg;
use crate::error::PipelineError;

/// `<category>_<unix seconds>.jpg`. Unique per category as long as the
/// cooldown is at least one second.
pub fn snapshot_file_name(category: &Category, timestamp: DateTime<Utc>) -> String {
    let safe: String = category
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{}_{}.jpg", safe, timestamp.timestamp())
}

/// Writes the snapshot, then exactly one record referencing it.
pub struct EvidencePersister {
    root: PathBuf,
    jpeg_quality: u8,
    store: Arc<dyn EvidenceStore>,
}

impl EvidencePersister {
    pub fn new(root: impl Into<PathBuf>, jpeg_quality: u8, store: Arc<dyn EvidenceStore>) -> Self {
        Self {
            root: root.into(),
            jpeg_quality,
            store,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &Arc<dyn EvidenceStore> {
        &self.store
    }

    pub fn persist(
        &self,
        image: &RgbImage,
        category: &Category,
        confidence: f32,
        timestamp: DateTime<Utc>,
    ) -> Result<EvidenceRecord, PipelineError> {
        std::fs::create_dir_all(&self.root).map_err(|e| {
            PipelineError::StorageError(format!(
                "create snapshot root {}: {}",
                self.root.display(),
                e
            ))
        })?;
        let jpeg = encode_jpeg(image, self.jpeg_quality)
            .map_err(|e| PipelineError::StorageError(e.to_string()))?;
        let name = snapshot_file_name(category, timestamp);
        let path = self.root.join(&name);
        std::fs::write(&path, &jpeg).map_err(|e| {
            PipelineError::StorageError(format!("write snapshot {}: {}", path.display(), e))
        })?;

        let id = self
            .store
            .create(category, confidence, timestamp, &name)
            .map_err(|e| PipelineError::storage(format!("{:#}", e)))?;
        log::info!(
            "evidence {} persisted: {} ({:.2}) -> {}",
            id,
            category,
            confidence,
            path.display()
        );
        Ok(EvidenceRecord {
            id,
            category: category.clone(),
            confidence,
            timestamp,
            snapshot_path: name,
            review: ReviewStatus::New,
        })
    }
}
