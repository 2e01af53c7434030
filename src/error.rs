//! Pipeline error taxonomy.
//!
//! Only `DeviceUnavailable` and `ReadError` stop a capture session. Every other
//! variant degrades a single cycle and is logged by the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Neither the primary nor the fallback device could be opened.
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Frame read failed mid-stream.
    #[error("frame read failed: {0}")]
    ReadError(String),

    #[error("inference failed: {0}")]
    InferenceError(String),

    #[error("frame encode failed: {0}")]
    EncodeError(String),

    #[error("evidence storage failed: {0}")]
    StorageError(String),

    #[error("alert dispatch failed: {0}")]
    NotifyError(String),
}

impl PipelineError {
    /// True when the error must terminate the capture session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::DeviceUnavailable(_) | PipelineError::ReadError(_)
        )
    }

    pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
        PipelineError::StorageError(err.to_string())
    }
}
