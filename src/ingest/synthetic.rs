//! Synthetic frame source (`stub://` devices).
//!
//! Produces a moving gradient so downstream stages see changing content without
//! any camera attached. Used by tests and by the daemon when configured with a
//! `stub://` device.

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};

use super::FrameSource;

pub struct SyntheticSource {
    device: String,
    width: u32,
    height: u32,
    connected: bool,
    frame_count: u64,
    /// Simulated scene state; advances every 50 frames.
    scene_state: u8,
}

impl SyntheticSource {
    pub fn new(device: &str, width: u32, height: u32) -> Self {
        Self {
            device: device.to_string(),
            width,
            height,
            connected: false,
            frame_count: 0,
            scene_state: 0,
        }
    }

    fn generate(&mut self) -> RgbImage {
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let shift = self.frame_count + self.scene_state as u64 * 17;
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let base = (x as u64 + y as u64 + shift) % 256;
            Rgb([base as u8, (base / 2) as u8, self.scene_state.wrapping_mul(40)])
        })
    }
}

impl FrameSource for SyntheticSource {
    fn device(&self) -> &str {
        &self.device
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.device);
        Ok(())
    }

    fn next_image(&mut self) -> Result<RgbImage> {
        if !self.connected {
            return Err(anyhow!("synthetic source {} not connected", self.device));
        }
        self.frame_count += 1;
        Ok(self.generate())
    }

    fn close(&mut self) {
        self.connected = false;
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_frames_change_between_reads() -> Result<()> {
        let mut source = SyntheticSource::new("stub://gradient", 8, 4);
        source.connect()?;
        let a = source.next_image()?;
        let b = source.next_image()?;
        assert_eq!(a.dimensions(), (8, 4));
        assert_ne!(a.as_raw(), b.as_raw());
        Ok(())
    }

    #[test]
    fn read_before_connect_fails() {
        let mut source = SyntheticSource::new("stub://cold", 8, 4);
        assert!(source.next_image().is_err());
    }
}
