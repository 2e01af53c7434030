//! The capture loop.
//!
//! One `Pipeline` owns every per-camera component: the capture handle, the
//! detector, scheduler, cooldown gate, evidence persister and notify queue. Each
//! iteration reads one frame, runs the scheduler, gates qualifying detections,
//! then encodes and publishes the display image. Only fatal capture errors end
//! the loop; everything else costs at most one cycle.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::annotate::Annotator;
use crate::broadcast::FrameBroadcaster;
use crate::config::WatchpostConfig;
use crate::detect::{Category, CategoryClassifier, DetectorBackend};
use crate::encode::{encode_jpeg, EncodedFrame};
use crate::error::PipelineError;
use crate::evidence::{EvidencePersister, EvidenceStore};
use crate::gate::AlertCooldownGate;
use crate::ingest::CaptureHandle;
use crate::notify::{Alert, HttpNotifier, NotifyDispatcher};
use crate::scheduler::{CycleMode, DetectionScheduler};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);
const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Components a pipeline is assembled from.
pub struct PipelineParts {
    pub scheduler: DetectionScheduler,
    pub gate: AlertCooldownGate,
    pub persister: EvidencePersister,
    pub notifier: NotifyDispatcher,
    pub broadcaster: Arc<FrameBroadcaster>,
}

impl PipelineParts {
    /// Wire up the components described by `cfg` around `store`.
    pub fn from_config(cfg: &WatchpostConfig, store: Arc<dyn EvidenceStore>) -> Result<Self> {
        let classifier = CategoryClassifier::new(&cfg.alerts.categories)?;
        let annotator = match &cfg.detection.font_path {
            Some(path) => Annotator::with_font_file(path)?,
            None => Annotator::new(),
        };
        let scheduler = DetectionScheduler::new(
            cfg.detection.skip_count,
            cfg.detection.recent_alert_frames,
            classifier,
            annotator,
        );
        let gate = AlertCooldownGate::new(cfg.alerts.cooldown, cfg.alerts.scope);
        let persister =
            EvidencePersister::new(cfg.snapshot_root.clone(), cfg.stream.jpeg_quality, store);
        let notifier = match &cfg.notify.endpoint {
            Some(endpoint) => NotifyDispatcher::spawn(
                Box::new(HttpNotifier::new(
                    endpoint.clone(),
                    cfg.notify.fields.clone(),
                    cfg.notify.timeout,
                )),
                cfg.notify.queue_depth,
            )?,
            None => {
                log::info!("no notify endpoint configured; outbound alerts disabled");
                NotifyDispatcher::disabled()
            }
        };
        Ok(Self {
            scheduler,
            gate,
            persister,
            notifier,
            broadcaster: Arc::new(FrameBroadcaster::new(cfg.stream.subscriber_buffer)),
        })
    }
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub frame_interval: Duration,
    pub jpeg_quality: u8,
    /// Prefix for snapshot URLs in alerts, without a trailing slash.
    pub public_base_url: String,
}

impl PipelineSettings {
    pub fn from_config(cfg: &WatchpostConfig) -> Self {
        Self {
            frame_interval: cfg.frame_interval,
            jpeg_quality: cfg.stream.jpeg_quality,
            public_base_url: cfg.public_base_url.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: u64,
    pub inferences: u64,
    pub inference_errors: u64,
    pub encode_errors: u64,
    pub storage_errors: u64,
    pub triggers: u64,
    pub discarded: u64,
}

/// What one iteration did.
#[derive(Clone, Debug)]
pub struct StepReport {
    pub seq: u64,
    pub mode: CycleMode,
    /// Categories whose gate opened on this frame.
    pub triggered: Vec<Category>,
    pub inference_failed: bool,
    pub published: bool,
    /// Stop was requested while inference ran; results were thrown away.
    pub discarded: bool,
}

pub struct Pipeline {
    capture: CaptureHandle,
    detector: Box<dyn DetectorBackend>,
    scheduler: DetectionScheduler,
    gate: AlertCooldownGate,
    persister: EvidencePersister,
    notifier: NotifyDispatcher,
    broadcaster: Arc<FrameBroadcaster>,
    settings: PipelineSettings,
    stop: Arc<AtomicBool>,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(
        capture: CaptureHandle,
        detector: Box<dyn DetectorBackend>,
        parts: PipelineParts,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            capture,
            detector,
            scheduler: parts.scheduler,
            gate: parts.gate,
            persister: parts.persister,
            notifier: parts.notifier,
            broadcaster: parts.broadcaster,
            settings,
            stop: Arc::new(AtomicBool::new(false)),
            stats: PipelineStats::default(),
        }
    }

    pub fn broadcaster(&self) -> Arc<FrameBroadcaster> {
        Arc::clone(&self.broadcaster)
    }

    /// Flag checked between iterations and after inference.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn scheduler(&self) -> &DetectionScheduler {
        &self.scheduler
    }

    pub fn notifier(&self) -> &NotifyDispatcher {
        &self.notifier
    }

    /// One loop iteration. `now` stamps gate decisions and evidence.
    pub fn step(&mut self, now: DateTime<Utc>) -> Result<StepReport, PipelineError> {
        let frame = self.capture.read()?;
        self.stats.frames += 1;

        let output = self.scheduler.run_cycle(&frame, self.detector.as_mut());
        let mut report = StepReport {
            seq: frame.seq,
            mode: output.mode,
            triggered: Vec::new(),
            inference_failed: output.inference_error.is_some(),
            published: false,
            discarded: false,
        };
        if output.mode == CycleMode::Infer {
            self.stats.inferences += 1;
            if report.inference_failed {
                self.stats.inference_errors += 1;
            }
            if self.stop.load(Ordering::SeqCst) {
                log::debug!("stop requested; discarding inference for frame {}", frame.seq);
                self.stats.discarded += 1;
                report.discarded = true;
                return Ok(report);
            }
        }

        for qualifying in &output.qualifying {
            if !self.gate.try_trigger(&qualifying.category, now) {
                log::debug!(
                    "{} ({:.2}) suppressed by cooldown",
                    qualifying.category,
                    qualifying.confidence
                );
                continue;
            }
            self.stats.triggers += 1;
            report.triggered.push(qualifying.category.clone());
            log::warn!(
                "{} detected on frame {} ({:.2})",
                qualifying.category,
                frame.seq,
                qualifying.confidence
            );

            let image_url = match self.persister.persist(
                &output.display,
                &qualifying.category,
                qualifying.confidence,
                now,
            ) {
                Ok(record) => Some(format!(
                    "{}/snapshots/{}",
                    self.settings.public_base_url, record.snapshot_path
                )),
                Err(err) => {
                    self.stats.storage_errors += 1;
                    log::warn!("{}; alerting without a snapshot", err);
                    None
                }
            };
            self.notifier.dispatch(Alert {
                image_url,
                category: qualifying.category.clone(),
                confidence: qualifying.confidence,
                timestamp: now,
            });
        }
        if !report.triggered.is_empty() {
            self.scheduler.note_trigger();
        }

        match encode_jpeg(&output.display, self.settings.jpeg_quality) {
            Ok(jpeg) => {
                self.broadcaster.publish(EncodedFrame {
                    seq: frame.seq,
                    jpeg,
                });
                report.published = true;
            }
            Err(err) => {
                self.stats.encode_errors += 1;
                log::warn!("frame {} not streamed: {}", frame.seq, err);
            }
        }
        Ok(report)
    }

    /// Run until stopped or until the device fails. Always releases the device
    /// and ends every stream subscription before returning.
    pub fn run(mut self) -> Result<PipelineStats, PipelineError> {
        log::info!(
            "pipeline started on {} with detector '{}' (inference every {} frame(s), interval {:?})",
            self.capture.device(),
            self.detector.name(),
            u64::from(self.scheduler.skip_count()) + 1,
            self.settings.frame_interval
        );
        let mut last_health_log = Instant::now();
        let result = loop {
            if self.stop.load(Ordering::SeqCst) {
                log::info!("pipeline stop requested");
                break Ok(());
            }
            let started = Instant::now();
            if let Err(err) = self.step(Utc::now()) {
                log::error!("pipeline stopping: {}", err);
                break Err(err);
            }

            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                log::info!(
                    "capture health={} frames={} inferences={} triggers={} subscribers={}",
                    self.capture.is_healthy(),
                    self.stats.frames,
                    self.stats.inferences,
                    self.stats.triggers,
                    self.broadcaster.subscriber_count()
                );
                last_health_log = Instant::now();
            }

            let pause = self
                .settings
                .frame_interval
                .saturating_sub(started.elapsed())
                .max(MIN_SLEEP);
            std::thread::sleep(pause);
        };
        self.shutdown();
        result.map(|()| self.stats.clone())
    }

    fn shutdown(&mut self) {
        self.broadcaster.close();
        self.capture.close();
        self.notifier.shutdown();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A pipeline running on its own thread.
pub struct PipelineHandle {
    stop: Arc<AtomicBool>,
    broadcaster: Arc<FrameBroadcaster>,
    join: Option<JoinHandle<Result<PipelineStats, PipelineError>>>,
}

impl PipelineHandle {
    pub fn spawn(pipeline: Pipeline) -> Result<Self> {
        let stop = pipeline.stop_flag();
        let broadcaster = pipeline.broadcaster();
        let join = std::thread::Builder::new()
            .name("watchpost-pipeline".to_string())
            .spawn(move || pipeline.run())
            .context("spawn pipeline thread")?;
        Ok(Self {
            stop,
            broadcaster,
            join: Some(join),
        })
    }

    pub fn broadcaster(&self) -> Arc<FrameBroadcaster> {
        Arc::clone(&self.broadcaster)
    }

    pub fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .map(|join| !join.is_finished())
            .unwrap_or(false)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop and wait for the loop to release the device.
    pub fn stop(mut self) -> Result<PipelineStats> {
        self.request_stop();
        self.wait()
    }

    fn wait(&mut self) -> Result<PipelineStats> {
        let join = self
            .join
            .take()
            .ok_or_else(|| anyhow!("pipeline already joined"))?;
        let outcome = join
            .join()
            .map_err(|_| anyhow!("pipeline thread panicked"))?;
        Ok(outcome?)
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.request_stop();
            if let Err(err) = self.wait() {
                log::warn!("pipeline ended with error: {:#}", err);
            }
        }
    }
}
