//! Frame annotation.
//!
//! Draws detection boxes and the three status markers. Markers are told apart by
//! colour and position so they stay readable when no font is configured:
//!
//! - detected-now: solid red banner across the top edge
//! - recent-alert: amber border around the whole frame
//! - processing-error: yellow banner across the bottom edge

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;

use crate::detect::{Category, Detection};

pub const MONITORED_BOX: Rgb<u8> = Rgb([230, 20, 20]);
pub const OTHER_BOX: Rgb<u8> = Rgb([20, 200, 60]);
pub const DETECTED_NOW: Rgb<u8> = Rgb([200, 0, 0]);
pub const RECENT_ALERT: Rgb<u8> = Rgb([255, 150, 0]);
pub const PROCESSING_ERROR: Rgb<u8> = Rgb([240, 220, 0]);
const TEXT: Rgb<u8> = Rgb([255, 255, 255]);
const TEXT_DARK: Rgb<u8> = Rgb([0, 0, 0]);

const BOX_THICKNESS: i32 = 2;
const BORDER_THICKNESS: i32 = 4;
const BANNER_HEIGHT: u32 = 22;

pub struct Annotator {
    font: Option<FontVec>,
    scale: PxScale,
}

impl Annotator {
    /// Annotator that draws geometry only.
    pub fn new() -> Self {
        Self {
            font: None,
            scale: PxScale::from(16.0),
        }
    }

    /// Annotator that also renders label text with the given TTF/OTF font.
    pub fn with_font_file(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("read font {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|_| anyhow!("invalid font file {}", path.display()))?;
        Ok(Self {
            font: Some(font),
            scale: PxScale::from(16.0),
        })
    }

    /// Boxes (and labels, when a font is loaded) for every detection.
    pub fn draw_detections(&self, image: &mut RgbImage, detections: &[(Detection, Option<Category>)]) {
        for (detection, category) in detections {
            let color = if category.is_some() {
                MONITORED_BOX
            } else {
                OTHER_BOX
            };
            let b = detection.bbox;
            let x = b.x1.round() as i32;
            let y = b.y1.round() as i32;
            let w = b.width().round().max(1.0) as u32;
            let h = b.height().round().max(1.0) as u32;
            for inset in 0..BOX_THICKNESS {
                let (iw, ih) = (
                    w.saturating_sub(2 * inset as u32).max(1),
                    h.saturating_sub(2 * inset as u32).max(1),
                );
                draw_hollow_rect_mut(image, Rect::at(x + inset, y + inset).of_size(iw, ih), color);
            }
            let text = format!("{} {:.2}", detection.label, detection.confidence);
            self.text(image, x + 2, (y - 18).max(0), color, &text);
        }
    }

    /// Primary marker: a monitored category was detected on this frame.
    pub fn mark_detected_now(&self, image: &mut RgbImage, text: &str) {
        let width = image.width().max(1);
        let height = BANNER_HEIGHT.min(image.height()).max(1);
        draw_filled_rect_mut(image, Rect::at(0, 0).of_size(width, height), DETECTED_NOW);
        self.text(image, 6, 3, TEXT, text);
    }

    /// Secondary marker: an alert fired recently; shown without re-triggering.
    pub fn mark_recent_alert(&self, image: &mut RgbImage) {
        let (w, h) = image.dimensions();
        for inset in 0..BORDER_THICKNESS {
            let iw = w.saturating_sub(2 * inset as u32);
            let ih = h.saturating_sub(2 * inset as u32);
            if iw == 0 || ih == 0 {
                break;
            }
            draw_hollow_rect_mut(image, Rect::at(inset, inset).of_size(iw, ih), RECENT_ALERT);
        }
        let y = h.saturating_sub(BANNER_HEIGHT * 2) as i32;
        self.text(image, 8, y, RECENT_ALERT, "RECENT ALERT");
    }

    /// Marker for a cycle whose inference call failed.
    pub fn mark_processing_error(&self, image: &mut RgbImage) {
        let width = image.width().max(1);
        let height = BANNER_HEIGHT.min(image.height()).max(1);
        let y = image.height().saturating_sub(height) as i32;
        draw_filled_rect_mut(image, Rect::at(0, y).of_size(width, height), PROCESSING_ERROR);
        self.text(image, 6, y + 3, TEXT_DARK, "PROCESSING ERROR");
    }

    fn text(&self, image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>, text: &str) {
        if let Some(font) = &self.font {
            draw_text_mut(image, color, x, y, self.scale, font, text);
        }
    }
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new()
    }
}
