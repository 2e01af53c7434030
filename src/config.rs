use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gate::GateScope;
use crate::ingest::CaptureSettings;
use crate::notify::FieldMapping;

const DEFAULT_DB_PATH: &str = "watchpost.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_DEVICE: &str = "/dev/video{index}";
const DEFAULT_PRIMARY_INDEX: u32 = 0;
const DEFAULT_FALLBACK_INDEX: u32 = 1;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FRAME_INTERVAL_MS: u64 = 100;
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_SKIP_COUNT: u32 = 2;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_SUBSCRIBER_BUFFER: usize = 4;
const DEFAULT_COOLDOWN_SECS: u64 = 5;
const DEFAULT_ALERT_WINDOW_SECS: u64 = 30;
const DEFAULT_SNAPSHOT_ROOT: &str = "snapshots";
const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 7;
const DEFAULT_NOTIFY_QUEUE: usize = 16;

#[derive(Debug, Deserialize, Default)]
struct WatchpostConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    capture: Option<CaptureConfigFile>,
    detection: Option<DetectionConfigFile>,
    stream: Option<StreamConfigFile>,
    alerts: Option<AlertsConfigFile>,
    evidence: Option<EvidenceConfigFile>,
    notify: Option<NotifyConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    public_base_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    device: Option<String>,
    primary_index: Option<u32>,
    fallback_index: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    frame_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    class_names: Option<Vec<String>>,
    confidence_threshold: Option<f32>,
    skip_count: Option<u32>,
    recent_alert_frames: Option<u32>,
    font_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    jpeg_quality: Option<u8>,
    subscriber_buffer: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsConfigFile {
    cooldown_secs: Option<u64>,
    alert_window_secs: Option<u64>,
    scope: Option<GateScope>,
    categories: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Deserialize, Default)]
struct EvidenceConfigFile {
    snapshot_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct NotifyConfigFile {
    endpoint: Option<String>,
    image_field: Option<String>,
    message_field: Option<String>,
    time_field: Option<String>,
    timeout_secs: Option<u64>,
    queue_depth: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct WatchpostConfig {
    pub db_path: String,
    pub api_addr: String,
    /// Base used to build snapshot URLs handed to the notifier.
    pub public_base_url: String,
    pub capture: CaptureSettings,
    pub frame_interval: Duration,
    pub detection: DetectionSettings,
    pub stream: StreamSettings,
    pub alerts: AlertSettings,
    pub snapshot_root: PathBuf,
    pub notify: NotifySettings,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub class_names: Vec<String>,
    pub confidence_threshold: f32,
    pub skip_count: u32,
    pub recent_alert_frames: u32,
    pub font_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub jpeg_quality: u8,
    pub subscriber_buffer: usize,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub cooldown: Duration,
    pub alert_window: Duration,
    pub scope: GateScope,
    /// Ordered by category name; earlier entries win on overlapping keywords.
    pub categories: Vec<(String, Vec<String>)>,
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
    pub endpoint: Option<String>,
    pub fields: FieldMapping,
    pub timeout: Duration,
    pub queue_depth: usize,
}

pub fn default_categories() -> Vec<(String, Vec<String>)> {
    let words = |xs: &[&str]| xs.iter().map(|x| x.to_string()).collect::<Vec<_>>();
    vec![
        (
            "blade".to_string(),
            words(&["knife", "blade", "machete", "sword", "dagger"]),
        ),
        (
            "firearm".to_string(),
            words(&["gun", "pistol", "rifle", "revolver", "firearm", "shotgun"]),
        ),
    ]
}

impl WatchpostConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("WATCHPOST_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Built-in defaults, no file and no environment.
    pub fn defaults() -> Self {
        Self::from_file(WatchpostConfigFile::default())
    }

    fn from_file(file: WatchpostConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api = file.api.unwrap_or_default();
        let api_addr = api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let public_base_url = api
            .public_base_url
            .unwrap_or_else(|| format!("http://{}", api_addr));

        let capture_file = file.capture.unwrap_or_default();
        let frame_interval = Duration::from_millis(
            capture_file
                .frame_interval_ms
                .unwrap_or(DEFAULT_FRAME_INTERVAL_MS),
        );
        let capture = CaptureSettings {
            device: capture_file
                .device
                .unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            primary_index: capture_file.primary_index.unwrap_or(DEFAULT_PRIMARY_INDEX),
            fallback_index: capture_file
                .fallback_index
                .unwrap_or(DEFAULT_FALLBACK_INDEX),
            width: capture_file.width.unwrap_or(DEFAULT_WIDTH),
            height: capture_file.height.unwrap_or(DEFAULT_HEIGHT),
            target_fps: fps_for_interval(frame_interval),
        };

        let detection_file = file.detection.unwrap_or_default();
        let skip_count = detection_file.skip_count.unwrap_or(DEFAULT_SKIP_COUNT);
        let detection = DetectionSettings {
            backend: detection_file
                .backend
                .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            model_path: detection_file.model_path,
            input_size: detection_file.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            class_names: detection_file.class_names.unwrap_or_default(),
            confidence_threshold: detection_file
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE),
            skip_count,
            recent_alert_frames: detection_file
                .recent_alert_frames
                .unwrap_or_else(|| default_recent_alert_frames(skip_count)),
            font_path: detection_file.font_path,
        };

        let stream_file = file.stream.unwrap_or_default();
        let stream = StreamSettings {
            jpeg_quality: stream_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            subscriber_buffer: stream_file
                .subscriber_buffer
                .unwrap_or(DEFAULT_SUBSCRIBER_BUFFER),
        };

        let alerts_file = file.alerts.unwrap_or_default();
        let alerts = AlertSettings {
            cooldown: Duration::from_secs(
                alerts_file.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS),
            ),
            alert_window: Duration::from_secs(
                alerts_file
                    .alert_window_secs
                    .unwrap_or(DEFAULT_ALERT_WINDOW_SECS),
            ),
            scope: alerts_file.scope.unwrap_or_default(),
            categories: alerts_file
                .categories
                .map(|map| map.into_iter().collect())
                .unwrap_or_else(default_categories),
        };

        let snapshot_root = file
            .evidence
            .and_then(|evidence| evidence.snapshot_root)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_ROOT));

        let notify_file = file.notify.unwrap_or_default();
        let defaults = FieldMapping::default();
        let notify = NotifySettings {
            endpoint: notify_file.endpoint.filter(|e| !e.trim().is_empty()),
            fields: FieldMapping {
                image: notify_file.image_field.unwrap_or(defaults.image),
                message: notify_file.message_field.unwrap_or(defaults.message),
                time: notify_file.time_field.unwrap_or(defaults.time),
            },
            timeout: Duration::from_secs(
                notify_file
                    .timeout_secs
                    .unwrap_or(DEFAULT_NOTIFY_TIMEOUT_SECS),
            ),
            queue_depth: notify_file.queue_depth.unwrap_or(DEFAULT_NOTIFY_QUEUE),
        };

        Self {
            db_path,
            api_addr,
            public_base_url,
            capture,
            frame_interval,
            detection,
            stream,
            alerts,
            snapshot_root,
            notify,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_string("WATCHPOST_DB_PATH") {
            self.db_path = path;
        }
        if let Some(addr) = env_string("WATCHPOST_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(url) = env_string("WATCHPOST_PUBLIC_URL") {
            self.public_base_url = url;
        }
        if let Some(device) = env_string("WATCHPOST_DEVICE") {
            self.capture.device = device;
        }
        if let Some(index) = env_parse::<u32>("WATCHPOST_DEVICE_INDEX", "a device index")? {
            self.capture.primary_index = index;
        }
        if let Some(index) = env_parse::<u32>("WATCHPOST_FALLBACK_INDEX", "a device index")? {
            self.capture.fallback_index = index;
        }
        if let Some(ms) =
            env_parse::<u64>("WATCHPOST_FRAME_INTERVAL_MS", "an integer number of milliseconds")?
        {
            self.frame_interval = Duration::from_millis(ms);
            self.capture.target_fps = fps_for_interval(self.frame_interval);
        }
        if let Some(backend) = env_string("WATCHPOST_DETECTOR") {
            self.detection.backend = backend;
        }
        if let Some(path) = env_string("WATCHPOST_MODEL_PATH") {
            self.detection.model_path = Some(PathBuf::from(path));
        }
        if let Some(skip) = env_parse::<u32>("WATCHPOST_SKIP_COUNT", "a non-negative integer")? {
            if self.detection.recent_alert_frames
                == default_recent_alert_frames(self.detection.skip_count)
            {
                self.detection.recent_alert_frames = default_recent_alert_frames(skip);
            }
            self.detection.skip_count = skip;
        }
        if let Some(secs) =
            env_parse::<u64>("WATCHPOST_COOLDOWN_SECS", "an integer number of seconds")?
        {
            self.alerts.cooldown = Duration::from_secs(secs);
        }
        if let Some(secs) =
            env_parse::<u64>("WATCHPOST_ALERT_WINDOW_SECS", "an integer number of seconds")?
        {
            self.alerts.alert_window = Duration::from_secs(secs);
        }
        if let Some(root) = env_string("WATCHPOST_SNAPSHOT_ROOT") {
            self.snapshot_root = PathBuf::from(root);
        }
        if let Some(url) = env_string("WATCHPOST_NOTIFY_URL") {
            self.notify.endpoint = Some(url);
        }
        if let Some(secs) =
            env_parse::<u64>("WATCHPOST_NOTIFY_TIMEOUT_SECS", "an integer number of seconds")?
        {
            self.notify.timeout = Duration::from_secs(secs);
        }
        if let Ok(labels) = std::env::var("WATCHPOST_CLASS_NAMES") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.detection.class_names = parsed;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.alerts.cooldown.is_zero() {
            return Err(anyhow!("alerts.cooldown_secs must be greater than zero"));
        }
        if self.alerts.alert_window.is_zero() {
            return Err(anyhow!("alerts.alert_window_secs must be greater than zero"));
        }
        if self.frame_interval.is_zero() {
            return Err(anyhow!("capture.frame_interval_ms must be greater than zero"));
        }
        if self.notify.timeout.is_zero() {
            return Err(anyhow!("notify.timeout_secs must be greater than zero"));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(anyhow!("stream.jpeg_quality must be within 1..=100"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture.width and capture.height must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(anyhow!("detection.confidence_threshold must be within 0..=1"));
        }

        let mut categories = Vec::with_capacity(self.alerts.categories.len());
        for (name, keywords) in &self.alerts.categories {
            let name = name.trim().to_lowercase();
            let keywords: Vec<String> = keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect();
            if name.is_empty() || keywords.is_empty() {
                continue;
            }
            categories.push((name, keywords));
        }
        if categories.is_empty() {
            return Err(anyhow!(
                "alerts.categories must name at least one category with a keyword"
            ));
        }
        self.alerts.categories = categories;

        match self.detection.backend.as_str() {
            "stub" => {}
            "tract" => {
                if self.detection.model_path.is_none() {
                    return Err(anyhow!("detection.backend 'tract' requires detection.model_path"));
                }
            }
            other => return Err(anyhow!("unknown detection.backend '{}'", other)),
        }

        if let Some(endpoint) = &self.notify.endpoint {
            validate_http_url("notify.endpoint", endpoint)?;
        }
        self.public_base_url = self.public_base_url.trim_end_matches('/').to_string();
        validate_http_url("api.public_base_url", &self.public_base_url)?;
        Ok(())
    }
}

pub fn default_recent_alert_frames(skip_count: u32) -> u32 {
    crate::scheduler::DetectionScheduler::default_recent_alert_frames(skip_count)
}

fn fps_for_interval(interval: Duration) -> u32 {
    let ms = interval.as_millis().max(1);
    ((1000 + ms - 1) / ms).max(1) as u32
}

fn validate_http_url(key: &str, value: &str) -> Result<()> {
    let parsed = url::Url::parse(value).map_err(|e| anyhow!("{} is not a URL: {}", key, e))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(anyhow!("{} must use http or https, not '{}'", key, other)),
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, what: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be {}", key, what)),
        None => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<WatchpostConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_rounds_up_from_interval() {
        assert_eq!(fps_for_interval(Duration::from_millis(100)), 10);
        assert_eq!(fps_for_interval(Duration::from_millis(300)), 4);
        assert_eq!(fps_for_interval(Duration::from_secs(5)), 1);
    }

    #[test]
    fn recent_alert_window_tracks_skip_count() {
        let mut file = WatchpostConfigFile::default();
        file.detection = Some(DetectionConfigFile {
            skip_count: Some(4),
            ..DetectionConfigFile::default()
        });
        let cfg = WatchpostConfig::from_file(file);
        assert_eq!(cfg.detection.recent_alert_frames, 10);
    }

    #[test]
    fn blank_categories_fail_validation() {
        let mut cfg = WatchpostConfig::defaults();
        cfg.alerts.categories = vec![("firearm".into(), vec!["  ".into()])];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn non_http_endpoint_is_rejected() {
        let mut cfg = WatchpostConfig::defaults();
        cfg.notify.endpoint = Some("ftp://example.com/hook".into());
        assert!(cfg.validate().is_err());
    }
}
