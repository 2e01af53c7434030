use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

/// Stub backend for running without a model. Reports a full-frame `motion`
/// detection whenever the pixel hash changes from the previous frame.
pub struct StubBackend {
    last_hash: Option<[u8; 32]>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self { last_hash: None }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let current_hash: [u8; 32] = Sha256::digest(frame.pixels()).into();

        let motion = self.last_hash.is_some_and(|prev| prev != current_hash);

        self.last_hash = Some(current_hash);

        if motion {
            let bbox = BoundingBox::new(0.0, 0.0, frame.width() as f32, frame.height() as f32);
            Ok(vec![Detection::new("motion", 0.85, bbox)])
        } else {
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_backend_reports_motion_on_change() {
        let mut backend = StubBackend::new();

        let r1 = backend.detect(&Frame::filled(1, 4, 4, [0, 0, 0])).unwrap();
        assert!(r1.is_empty());

        let r2 = backend.detect(&Frame::filled(2, 4, 4, [9, 9, 9])).unwrap();
        assert_eq!(r2.len(), 1);
        assert_eq!(r2[0].label, "motion");
        assert_eq!(r2[0].confidence, 0.85);

        let r3 = backend.detect(&Frame::filled(3, 4, 4, [9, 9, 9])).unwrap();
        assert!(r3.is_empty());
    }
}
