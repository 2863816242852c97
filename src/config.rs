use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::annotate::{DEFAULT_EVENT_LABEL, DEFAULT_EVENT_THRESHOLD};
use crate::events::DEFAULT_POLL_INTERVAL;
use crate::ingest::CameraSettings;
use crate::pipeline::DEFAULT_MAX_BLANK_FRAMES;
use crate::publish::DEFAULT_BOUNDARY;

const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_CAMERA_DEVICE: &str = "/dev/video0";
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_CAMERA_FPS: u32 = 30;
const DEFAULT_CAMERA_FOURCC: &str = "MJPG";
const DEFAULT_CAMERA_JPEG_QUALITY: u8 = 90;
const DEFAULT_FILE_JPEG_QUALITY: u8 = 95;
const DEFAULT_DETECTOR: &str = "stub";
const DEFAULT_DETECTOR_INPUT: u32 = 640;
const DEFAULT_DETECTOR_MIN_CONFIDENCE: f32 = 0.25;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RoadwatchConfigFile {
    api: Option<ApiConfigFile>,
    camera: Option<CameraConfigFile>,
    stream: Option<StreamConfigFile>,
    events: Option<EventsConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApiConfigFile {
    addr: Option<String>,
    upload_dir: Option<PathBuf>,
    max_upload_bytes: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    fourcc: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    boundary: Option<String>,
    camera_jpeg_quality: Option<u8>,
    file_jpeg_quality: Option<u8>,
    max_blank_frames: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct EventsConfigFile {
    poll_interval_ms: Option<u64>,
    label: Option<String>,
    threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    labels: Option<Vec<String>>,
    min_confidence: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct RoadwatchConfig {
    pub api: ApiSettings,
    pub camera: CameraSettings,
    pub stream: StreamSettings,
    pub events: EventSettings,
    pub detector: DetectorSettings,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub addr: String,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub boundary: String,
    pub camera_jpeg_quality: u8,
    pub file_jpeg_quality: u8,
    pub max_blank_frames: u32,
}

#[derive(Debug, Clone)]
pub struct EventSettings {
    pub poll_interval: Duration,
    pub label: String,
    pub threshold: f32,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub labels: Vec<String>,
    pub min_confidence: f32,
}

impl Default for RoadwatchConfig {
    fn default() -> Self {
        // An empty file section resolves every field to its default.
        Self::from_file(RoadwatchConfigFile::default())
    }
}

impl RoadwatchConfig {
    /// Defaults, then the file named by `ROADWATCH_CONFIG`, then environment
    /// overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROADWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with an explicit config file in place of `ROADWATCH_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => RoadwatchConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RoadwatchConfigFile) -> Self {
        let api = file.api.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let events = file.events.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();

        Self {
            api: ApiSettings {
                addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
                upload_dir: api
                    .upload_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
                max_upload_bytes: api.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            },
            camera: CameraSettings {
                device: camera
                    .device
                    .unwrap_or_else(|| DEFAULT_CAMERA_DEVICE.to_string()),
                width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
                fps: camera.fps.unwrap_or(DEFAULT_CAMERA_FPS),
                fourcc: camera
                    .fourcc
                    .unwrap_or_else(|| DEFAULT_CAMERA_FOURCC.to_string()),
            },
            stream: StreamSettings {
                boundary: stream
                    .boundary
                    .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string()),
                camera_jpeg_quality: stream
                    .camera_jpeg_quality
                    .unwrap_or(DEFAULT_CAMERA_JPEG_QUALITY),
                file_jpeg_quality: stream
                    .file_jpeg_quality
                    .unwrap_or(DEFAULT_FILE_JPEG_QUALITY),
                max_blank_frames: stream.max_blank_frames.unwrap_or(DEFAULT_MAX_BLANK_FRAMES),
            },
            events: EventSettings {
                poll_interval: events
                    .poll_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_POLL_INTERVAL),
                label: events
                    .label
                    .unwrap_or_else(|| DEFAULT_EVENT_LABEL.to_string()),
                threshold: events.threshold.unwrap_or(DEFAULT_EVENT_THRESHOLD),
            },
            detector: DetectorSettings {
                backend: detector
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
                model_path: detector.model_path,
                input_width: detector.input_width.unwrap_or(DEFAULT_DETECTOR_INPUT),
                input_height: detector.input_height.unwrap_or(DEFAULT_DETECTOR_INPUT),
                labels: detector
                    .labels
                    .unwrap_or_else(|| vec![DEFAULT_EVENT_LABEL.to_string()]),
                min_confidence: detector
                    .min_confidence
                    .unwrap_or(DEFAULT_DETECTOR_MIN_CONFIDENCE),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_non_empty("ROADWATCH_API_ADDR") {
            self.api.addr = addr;
        }
        if let Some(dir) = env_non_empty("ROADWATCH_UPLOAD_DIR") {
            self.api.upload_dir = PathBuf::from(dir);
        }
        if let Some(device) = env_non_empty("ROADWATCH_CAMERA_DEVICE") {
            self.camera.device = device;
        }
        if let Some(quality) = env_non_empty("ROADWATCH_CAMERA_JPEG_QUALITY") {
            self.stream.camera_jpeg_quality = quality.parse().map_err(|_| {
                anyhow!("ROADWATCH_CAMERA_JPEG_QUALITY must be an integer from 1 to 100")
            })?;
        }
        if let Some(poll) = env_non_empty("ROADWATCH_EVENT_POLL_MS") {
            let millis: u64 = poll.parse().map_err(|_| {
                anyhow!("ROADWATCH_EVENT_POLL_MS must be an integer number of milliseconds")
            })?;
            self.events.poll_interval = Duration::from_millis(millis);
        }
        if let Some(backend) = env_non_empty("ROADWATCH_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = env_non_empty("ROADWATCH_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for (name, quality) in [
            ("camera_jpeg_quality", self.stream.camera_jpeg_quality),
            ("file_jpeg_quality", self.stream.file_jpeg_quality),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(anyhow!("{} must be between 1 and 100", name));
            }
        }
        if !(0.0..=1.0).contains(&self.events.threshold) {
            return Err(anyhow!("events.threshold must be between 0 and 1"));
        }
        if !(0.0..=1.0).contains(&self.detector.min_confidence) {
            return Err(anyhow!("detector.min_confidence must be between 0 and 1"));
        }
        if self.camera.width == 0 || self.camera.height == 0 || self.camera.fps == 0 {
            return Err(anyhow!("camera width, height and fps must be greater than zero"));
        }
        if self.camera.fourcc.len() != 4 {
            return Err(anyhow!("camera.fourcc must be four characters"));
        }
        if self.detector.input_width == 0 || self.detector.input_height == 0 {
            return Err(anyhow!("detector input size must be greater than zero"));
        }
        if self.events.poll_interval.is_zero() {
            return Err(anyhow!("events.poll_interval_ms must be greater than zero"));
        }
        if self.events.label.trim().is_empty() {
            return Err(anyhow!("events.label must not be empty"));
        }
        validate_boundary(&self.stream.boundary)?;
        if self.api.max_upload_bytes == 0 {
            return Err(anyhow!("api.max_upload_bytes must be greater than zero"));
        }
        Ok(())
    }
}

/// Multipart boundaries are restricted to RFC 2046 token characters, minus
/// space.
fn validate_boundary(boundary: &str) -> Result<()> {
    if boundary.is_empty() || boundary.len() > 70 {
        return Err(anyhow!("stream.boundary must be 1 to 70 characters"));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || "'()+_,-./:=?".contains(c);
    if !boundary.chars().all(allowed) {
        return Err(anyhow!(
            "stream.boundary contains characters not allowed in a multipart boundary"
        ));
    }
    Ok(())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<RoadwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_service() {
        let cfg = RoadwatchConfig::default();
        assert_eq!(cfg.api.addr, "127.0.0.1:5000");
        assert_eq!(cfg.api.upload_dir, PathBuf::from("uploads"));
        assert_eq!(cfg.camera, CameraSettings::default());
        assert_eq!(cfg.stream.boundary, "frame");
        assert_eq!(cfg.stream.camera_jpeg_quality, 90);
        assert_eq!(cfg.stream.file_jpeg_quality, 95);
        assert_eq!(cfg.stream.max_blank_frames, 30);
        assert_eq!(cfg.events.poll_interval, Duration::from_millis(100));
        assert_eq!(cfg.events.label, "pothole");
        assert_eq!(cfg.events.threshold, 0.5);
        assert_eq!(cfg.detector.backend, "stub");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn boundary_rejects_header_breaking_characters() {
        assert!(validate_boundary("frame").is_ok());
        assert!(validate_boundary("frame\r\nX-Injected: 1").is_err());
        assert!(validate_boundary("").is_err());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut cfg = RoadwatchConfig::default();
        cfg.stream.camera_jpeg_quality = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RoadwatchConfig::default();
        cfg.events.threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = RoadwatchConfig::default();
        cfg.camera.fps = 0;
        assert!(cfg.validate().is_err());
    }
}
