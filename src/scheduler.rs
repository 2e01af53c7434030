//! Detection scheduling.
//!
//! Inference runs on every `(skip_count + 1)`-th frame. Frames in between are
//! displayed as the cached annotation from the last successful inference, or
//! raw before the first one completes.

use image::RgbImage;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::annotate::Annotator;
use crate::detect::{Category, CategoryClassifier, DetectorBackend};
use crate::error::PipelineError;
use crate::frame::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleMode {
    Skip,
    Infer,
}

/// Most recent inference-derived annotation and the frame it was drawn on.
#[derive(Clone, Debug)]
pub struct AnnotationState {
    pub seq: u64,
    pub image: Arc<RgbImage>,
}

/// A monitored detection, strongest per category for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Qualifying {
    pub category: Category,
    pub confidence: f32,
}

#[derive(Debug)]
pub struct CycleOutput {
    pub mode: CycleMode,
    /// Image to encode and broadcast this cycle.
    pub display: Arc<RgbImage>,
    /// Empty on skip cycles and failed inferences.
    pub qualifying: Vec<Qualifying>,
    pub inference_error: Option<PipelineError>,
}

pub struct DetectionScheduler {
    skip_count: u32,
    frames_seen: u64,
    inferences: u64,
    classifier: CategoryClassifier,
    annotator: Annotator,
    state: Option<AnnotationState>,
    recent_alert_frames: u32,
    recent_alert_remaining: u32,
}

impl DetectionScheduler {
    pub fn new(
        skip_count: u32,
        recent_alert_frames: u32,
        classifier: CategoryClassifier,
        annotator: Annotator,
    ) -> Self {
        Self {
            skip_count,
            frames_seen: 0,
            inferences: 0,
            classifier,
            annotator,
            state: None,
            recent_alert_frames,
            recent_alert_remaining: 0,
        }
    }

    /// Default recent-alert window: two inference periods.
    pub fn default_recent_alert_frames(skip_count: u32) -> u32 {
        skip_count.saturating_add(1).saturating_mul(2)
    }

    pub fn skip_count(&self) -> u32 {
        self.skip_count
    }

    pub fn classifier(&self) -> &CategoryClassifier {
        &self.classifier
    }

    pub fn annotation(&self) -> Option<&AnnotationState> {
        self.state.as_ref()
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn inferences(&self) -> u64 {
        self.inferences
    }

    pub fn recent_alert_active(&self) -> bool {
        self.recent_alert_remaining > 0
    }

    /// Mode the next call to `run_cycle` will use.
    pub fn next_mode(&self) -> CycleMode {
        self.mode_for(self.frames_seen + 1)
    }

    fn mode_for(&self, count: u64) -> CycleMode {
        let period = u64::from(self.skip_count) + 1;
        if count % period == 0 {
            CycleMode::Infer
        } else {
            CycleMode::Skip
        }
    }

    /// Start the recent-alert window: the next `recent_alert_frames` frames
    /// carry the marker. Called once the gate has opened.
    pub fn note_trigger(&mut self) {
        self.recent_alert_remaining = self.recent_alert_frames;
    }

    /// Process one captured frame.
    pub fn run_cycle(&mut self, frame: &Frame, detector: &mut dyn DetectorBackend) -> CycleOutput {
        self.frames_seen += 1;
        let recent_alert = self.recent_alert_active();
        self.recent_alert_remaining = self.recent_alert_remaining.saturating_sub(1);

        match self.mode_for(self.frames_seen) {
            CycleMode::Skip => {
                let display = match &self.state {
                    Some(state) => Arc::clone(&state.image),
                    None => Arc::new(frame.image().clone()),
                };
                CycleOutput {
                    mode: CycleMode::Skip,
                    display,
                    qualifying: Vec::new(),
                    inference_error: None,
                }
            }
            CycleMode::Infer => self.infer(frame, detector, recent_alert),
        }
    }

    fn infer(
        &mut self,
        frame: &Frame,
        detector: &mut dyn DetectorBackend,
        recent_alert: bool,
    ) -> CycleOutput {
        self.inferences += 1;
        let detections = match detector.detect(frame) {
            Ok(detections) => detections,
            Err(err) => {
                log::warn!("inference failed on frame {}: {:#}", frame.seq, err);
                let mut image = frame.image().clone();
                self.annotator.mark_processing_error(&mut image);
                return CycleOutput {
                    mode: CycleMode::Infer,
                    display: Arc::new(image),
                    qualifying: Vec::new(),
                    inference_error: Some(PipelineError::InferenceError(format!("{:#}", err))),
                };
            }
        };

        let classified: Vec<_> = detections
            .into_iter()
            .map(|d| {
                let category = self.classifier.classify(&d.label);
                (d, category)
            })
            .collect();

        let mut strongest: BTreeMap<Category, f32> = BTreeMap::new();
        for (detection, category) in &classified {
            if let Some(category) = category {
                let entry = strongest.entry(category.clone()).or_insert(0.0);
                if detection.confidence > *entry {
                    *entry = detection.confidence;
                }
            }
        }
        let qualifying: Vec<Qualifying> = strongest
            .into_iter()
            .map(|(category, confidence)| Qualifying {
                category,
                confidence,
            })
            .collect();

        let mut image = frame.image().clone();
        self.annotator.draw_detections(&mut image, &classified);
        if !qualifying.is_empty() {
            let names: Vec<&str> = qualifying.iter().map(|q| q.category.as_str()).collect();
            let banner = format!("DETECTED: {}", names.join(", ").to_uppercase());
            self.annotator.mark_detected_now(&mut image, &banner);
        } else if recent_alert {
            self.annotator.mark_recent_alert(&mut image);
        }
        log::debug!(
            "frame {}: {} detection(s), {} monitored",
            frame.seq,
            classified.len(),
            qualifying.len()
        );

        let image = Arc::new(image);
        self.state = Some(AnnotationState {
            seq: frame.seq,
            image: Arc::clone(&image),
        });
        CycleOutput {
            mode: CycleMode::Infer,
            display: image,
            qualifying,
            inference_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::{PROCESSING_ERROR, RECENT_ALERT};
    use crate::detect::{BoundingBox, Detection};
    use anyhow::{anyhow, Result};
    use std::collections::VecDeque;

    struct Scripted {
        calls: usize,
        replies: VecDeque<Result<Vec<Detection>>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<Vec<Detection>>>) -> Self {
            Self {
                calls: 0,
                replies: replies.into(),
            }
        }
    }

    impl DetectorBackend for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            self.calls += 1;
            self.replies.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn scheduler(skip: u32) -> DetectionScheduler {
        let classifier = CategoryClassifier::new(&[
            ("firearm".to_string(), vec!["gun".into(), "pistol".into()]),
            ("blade".to_string(), vec!["knife".into()]),
        ])
        .unwrap();
        DetectionScheduler::new(
            skip,
            DetectionScheduler::default_recent_alert_frames(skip),
            classifier,
            Annotator::new(),
        )
    }

    fn gun(confidence: f32) -> Detection {
        Detection::new("pistol", confidence, BoundingBox::new(4.0, 4.0, 20.0, 20.0))
    }

    #[test]
    fn infers_every_third_frame_with_skip_two() {
        let mut s = scheduler(2);
        let mut d = Scripted::new(vec![]);
        let modes: Vec<_> = (1..=6)
            .map(|seq| s.run_cycle(&Frame::filled(seq, 32, 32, [9, 9, 9]), &mut d).mode)
            .collect();
        use CycleMode::*;
        assert_eq!(modes, vec![Skip, Skip, Infer, Skip, Skip, Infer]);
        assert_eq!(d.calls, 2);
        assert_eq!(s.inferences(), 2);
    }

    #[test]
    fn skip_zero_infers_every_frame() {
        let mut s = scheduler(0);
        let mut d = Scripted::new(vec![]);
        for seq in 1..=3 {
            assert_eq!(
                s.run_cycle(&Frame::filled(seq, 8, 8, [0, 0, 0]), &mut d).mode,
                CycleMode::Infer
            );
        }
    }

    #[test]
    fn cold_start_skip_shows_raw_frame() {
        let mut s = scheduler(2);
        let mut d = Scripted::new(vec![]);
        let frame = Frame::filled(1, 16, 16, [1, 2, 3]);
        let out = s.run_cycle(&frame, &mut d);
        assert_eq!(out.mode, CycleMode::Skip);
        assert_eq!(&*out.display, frame.image());
    }

    #[test]
    fn skip_reuses_last_inference_annotation() {
        let mut s = scheduler(1);
        let mut d = Scripted::new(vec![Ok(vec![gun(0.9)])]);
        s.run_cycle(&Frame::filled(1, 32, 32, [0, 0, 0]), &mut d);
        let inferred = s.run_cycle(&Frame::filled(2, 32, 32, [0, 0, 0]), &mut d);
        assert_eq!(inferred.qualifying.len(), 1);
        let skipped = s.run_cycle(&Frame::filled(3, 32, 32, [200, 200, 200]), &mut d);
        assert_eq!(skipped.mode, CycleMode::Skip);
        assert!(Arc::ptr_eq(&skipped.display, &inferred.display));
        assert_eq!(s.annotation().map(|a| a.seq), Some(2));
    }

    #[test]
    fn strongest_detection_per_category_is_forwarded() {
        let mut s = scheduler(0);
        let mut d = Scripted::new(vec![Ok(vec![
            gun(0.6),
            gun(0.8),
            Detection::new("kitchen knife", 0.7, BoundingBox::new(0.0, 0.0, 5.0, 5.0)),
            Detection::new("person", 0.99, BoundingBox::new(0.0, 0.0, 5.0, 5.0)),
        ])]);
        let out = s.run_cycle(&Frame::filled(1, 32, 32, [0, 0, 0]), &mut d);
        assert_eq!(
            out.qualifying,
            vec![
                Qualifying {
                    category: Category::new("blade"),
                    confidence: 0.7
                },
                Qualifying {
                    category: Category::new("firearm"),
                    confidence: 0.8
                },
            ]
        );
    }

    #[test]
    fn inference_failure_marks_frame_and_keeps_cache() {
        let mut s = scheduler(0);
        let mut d = Scripted::new(vec![Ok(vec![gun(0.9)]), Err(anyhow!("model crashed"))]);
        let first = s.run_cycle(&Frame::filled(1, 32, 32, [0, 0, 0]), &mut d);
        let failed = s.run_cycle(&Frame::filled(2, 32, 32, [0, 0, 0]), &mut d);
        assert!(matches!(
            failed.inference_error,
            Some(PipelineError::InferenceError(_))
        ));
        assert!(failed.qualifying.is_empty());
        assert_eq!(failed.display.get_pixel(16, 31), &PROCESSING_ERROR);
        let cached = s.annotation().unwrap();
        assert_eq!(cached.seq, 1);
        assert!(Arc::ptr_eq(&cached.image, &first.display));
    }

    #[test]
    fn recent_alert_marker_covers_whole_window_then_decays() {
        let mut s = scheduler(0);
        let window = DetectionScheduler::default_recent_alert_frames(0);
        assert_eq!(window, 2);
        let mut d = Scripted::new(vec![Ok(vec![gun(0.9)])]);
        s.run_cycle(&Frame::filled(1, 32, 32, [0, 0, 0]), &mut d);
        s.note_trigger();

        for seq in 2..2 + u64::from(window) {
            let out = s.run_cycle(&Frame::filled(seq, 32, 32, [0, 0, 0]), &mut d);
            assert_eq!(out.display.get_pixel(0, 16), &RECENT_ALERT, "frame {}", seq);
        }
        assert!(!s.recent_alert_active());

        let after = s.run_cycle(&Frame::filled(2 + u64::from(window), 32, 32, [0, 0, 0]), &mut d);
        assert_ne!(after.display.get_pixel(0, 16), &RECENT_ALERT);
    }

    #[test]
    fn recent_alert_window_reaches_second_inference_after_trigger() {
        let mut s = scheduler(2);
        let window = DetectionScheduler::default_recent_alert_frames(2);
        assert_eq!(window, 6);
        let mut d = Scripted::new(vec![Ok(vec![gun(0.9)])]);
        for seq in 1..=3 {
            s.run_cycle(&Frame::filled(seq, 32, 32, [0, 0, 0]), &mut d);
        }
        s.note_trigger();

        let mut marked_inferences = Vec::new();
        for seq in 4..=12 {
            let out = s.run_cycle(&Frame::filled(seq, 32, 32, [0, 0, 0]), &mut d);
            if out.mode == CycleMode::Infer && out.display.get_pixel(0, 16) == &RECENT_ALERT {
                marked_inferences.push(seq);
            }
            if seq == 3 + u64::from(window) {
                assert!(!s.recent_alert_active());
            }
        }
        assert_eq!(marked_inferences, vec![6, 9]);
    }
}
