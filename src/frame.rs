//! Captured frames.
//!
//! - `Frame`: one RGB raster stamped with a capture sequence number and wall-clock time.
//!
//! Sequence numbers are assigned by the `CaptureHandle` that read the frame, never by
//! the source backend, so they are strictly increasing for one capture session.

use chrono::{DateTime, Utc};
use image::{Rgb, RgbImage};

/// One captured raster image.
///
/// A frame is owned by the pipeline iteration that read it. Anything shared with
/// stream subscribers is an encoded copy, never the frame itself.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Monotonic capture sequence number (1-based).
    pub seq: u64,
    /// Wall-clock capture time.
    pub captured_at: DateTime<Utc>,
    image: RgbImage,
}

impl Frame {
    pub fn new(seq: u64, captured_at: DateTime<Utc>, image: RgbImage) -> Self {
        Self {
            seq,
            captured_at,
            image,
        }
    }

    /// Uniformly coloured frame. Used by synthetic sources and tests.
    pub fn filled(seq: u64, width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self::new(
            seq,
            Utc::now(),
            RgbImage::from_pixel(width, height, Rgb(rgb)),
        )
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Packed RGB24 bytes, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}
