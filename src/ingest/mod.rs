//! Frame ingestion.
//!
//! - `FrameSource`: backend trait (synthetic `stub://` sources, V4L2 devices).
//! - `CaptureHandle`: the single open handle on a capture device. Stamps frame
//!   sequence numbers and holds the process-wide device claim until closed.
//! - `open_capture`: primary-then-fallback acquisition.
//!
//! A device is an exclusive resource: while a `CaptureHandle` for it exists, any
//! further attempt to open the same device fails. Closing is idempotent and also
//! runs on drop, so every exit path releases the device.
//!
//! Exclusivity is per device identity (`FrameSource::device`), not per process.
//! Each camera pipeline owns one handle on its own device, so two handles may be
//! open at once when they name different devices, e.g. a second `open_capture`
//! landing on the fallback index while the primary is held.

#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use chrono::Utc;
use image::RgbImage;
use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

use crate::error::PipelineError;
use crate::frame::Frame;

pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Capture backend.
pub trait FrameSource: Send {
    /// Stable device identity (path or URI). Used as the exclusivity key.
    fn device(&self) -> &str;

    /// Open the underlying device.
    fn connect(&mut self) -> Result<()>;

    /// Read the next raster at device-native rate.
    fn next_image(&mut self) -> Result<RgbImage>;

    /// Release the underlying device. Must tolerate repeated calls.
    fn close(&mut self);

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Capture settings resolved from configuration.
#[derive(Clone, Debug)]
pub struct CaptureSettings {
    /// Device template; `{index}` is replaced by the device index.
    pub device: String,
    pub primary_index: u32,
    pub fallback_index: u32,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device: "/dev/video{index}".to_string(),
            primary_index: 0,
            fallback_index: 1,
            width: 640,
            height: 480,
            target_fps: 10,
        }
    }
}

impl CaptureSettings {
    pub fn device_for(&self, index: u32) -> String {
        self.device.replace("{index}", &index.to_string())
    }
}

/// Build the backend for a device path. `stub://` yields a synthetic source.
pub fn source_for_device(
    device: &str,
    settings: &CaptureSettings,
) -> Result<Box<dyn FrameSource>> {
    if device.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(
            device,
            settings.width,
            settings.height,
        )));
    }
    #[cfg(feature = "ingest-v4l2")]
    {
        Ok(Box::new(V4l2Source::new(v4l2::V4l2Config {
            device: device.to_string(),
            target_fps: settings.target_fps,
            width: settings.width,
            height: settings.height,
        })))
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        Err(anyhow!(
            "device capture of '{}' requires the ingest-v4l2 feature",
            device
        ))
    }
}

/// Open the configured device, trying the primary index then the fallback index.
pub fn open_configured(settings: &CaptureSettings) -> Result<CaptureHandle, PipelineError> {
    open_capture(settings.primary_index, settings.fallback_index, |index| {
        source_for_device(&settings.device_for(index), settings)
    })
}

/// Acquire a capture handle: primary index first, then one fallback index.
///
/// `open` builds an unconnected source for an index. Fails with
/// `DeviceUnavailable` when neither index yields a connected, unclaimed device.
pub fn open_capture<F>(
    primary: u32,
    fallback: u32,
    mut open: F,
) -> Result<CaptureHandle, PipelineError>
where
    F: FnMut(u32) -> Result<Box<dyn FrameSource>>,
{
    let mut failures = Vec::new();
    let mut indices = vec![primary];
    if fallback != primary {
        indices.push(fallback);
    }

    for index in indices {
        match try_open(index, &mut open) {
            Ok(handle) => {
                log::info!(
                    "capture: opened {} (index {})",
                    handle.device(),
                    handle.index()
                );
                return Ok(handle);
            }
            Err(err) => {
                log::warn!("capture: index {} unavailable: {:#}", index, err);
                failures.push(format!("index {}: {}", index, err));
            }
        }
    }

    Err(PipelineError::DeviceUnavailable(failures.join("; ")))
}

fn try_open<F>(index: u32, open: &mut F) -> Result<CaptureHandle>
where
    F: FnMut(u32) -> Result<Box<dyn FrameSource>>,
{
    let mut source = open(index)?;
    let claim = DeviceClaim::acquire(source.device())?;
    source.connect()?;
    Ok(CaptureHandle {
        source,
        index,
        seq: 0,
        claim: Some(claim),
    })
}

/// The one open handle on a capture device.
pub struct CaptureHandle {
    source: Box<dyn FrameSource>,
    index: u32,
    seq: u64,
    claim: Option<DeviceClaim>,
}

impl CaptureHandle {
    pub fn device(&self) -> &str {
        self.source.device()
    }

    /// Index the handle was opened with (primary or fallback).
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_open(&self) -> bool {
        self.claim.is_some()
    }

    pub fn frames_read(&self) -> u64 {
        self.seq
    }

    pub fn is_healthy(&self) -> bool {
        self.is_open() && self.source.is_healthy()
    }

    /// Read the next frame and stamp it with the next sequence number.
    pub fn read(&mut self) -> Result<Frame, PipelineError> {
        if !self.is_open() {
            return Err(PipelineError::ReadError(format!(
                "{} is closed",
                self.source.device()
            )));
        }
        let image = self
            .source
            .next_image()
            .map_err(|err| PipelineError::ReadError(format!("{:#}", err)))?;
        self.seq += 1;
        Ok(Frame::new(self.seq, Utc::now(), image))
    }

    /// Release the device. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(claim) = self.claim.take() {
            self.source.close();
            log::info!(
                "capture: closed {} after {} frames",
                claim.device,
                self.seq
            );
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn claimed_devices() -> &'static Mutex<HashSet<String>> {
    static CLAIMED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    CLAIMED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Process-wide exclusive claim on one device identity.
struct DeviceClaim {
    device: String,
}

impl DeviceClaim {
    fn acquire(device: &str) -> Result<Self> {
        let mut claimed = claimed_devices()
            .lock()
            .map_err(|_| anyhow!("device claim registry poisoned"))?;
        if !claimed.insert(device.to_string()) {
            return Err(anyhow!("{} is already held by another capture handle", device));
        }
        Ok(Self {
            device: device.to_string(),
        })
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        if let Ok(mut claimed) = claimed_devices().lock() {
            claimed.remove(&self.device);
        }
    }
}
