use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Object detector capability.
///
/// The pipeline treats implementations as opaque: a frame goes in, zero or more
/// labeled detections come out. Implementations must not retain the frame beyond
/// the `detect` call. An `Err` is an inference failure for that cycle only.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

