//! JPEG encoding and MJPEG multipart framing.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};

use crate::error::PipelineError;

/// Multipart boundary token used by the stream endpoint.
pub const BOUNDARY: &str = "frame";

/// One encoded frame as shared with every stream subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedFrame {
    pub seq: u64,
    pub jpeg: Vec<u8>,
}

impl EncodedFrame {
    /// Bytes of one `multipart/x-mixed-replace` part, boundary included.
    pub fn multipart_chunk(&self) -> Vec<u8> {
        let header = format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            BOUNDARY,
            self.jpeg.len()
        );
        let mut out = Vec::with_capacity(header.len() + self.jpeg.len() + 2);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.jpeg);
        out.extend_from_slice(b"\r\n");
        out
    }
}

pub fn stream_content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)
}

/// Compress an RGB image at fixed quality (1..=100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, PipelineError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(PipelineError::EncodeError("empty image".to_string()));
    }
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| PipelineError::EncodeError(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn encodes_decodable_jpeg() {
        let image = RgbImage::from_pixel(16, 8, Rgb([120, 30, 200]));
        let jpeg = encode_jpeg(&image, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
    }

    #[test]
    fn empty_image_is_an_encode_error() {
        let err = encode_jpeg(&RgbImage::new(0, 0), 80).unwrap_err();
        assert!(matches!(err, PipelineError::EncodeError(_)));
    }

    #[test]
    fn chunk_carries_boundary_and_length() {
        let frame = EncodedFrame {
            seq: 3,
            jpeg: vec![1, 2, 3, 4],
        };
        let chunk = frame.multipart_chunk();
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n"));
        assert!(chunk.ends_with(&[1, 2, 3, 4, b'\r', b'\n']));
    }
}
