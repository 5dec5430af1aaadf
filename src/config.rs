use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::settings::DetectionSettings;

const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_SOURCE_URI: &str = "stub://street_camera";
const DEFAULT_SOURCE_FPS: u32 = 30;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_PLATE_CONFIDENCE: f32 = 0.65;
const DEFAULT_PLATE_INPUT_SIZE: u32 = 416;
const DEFAULT_PLATE_IOU: f32 = 0.7;
const DEFAULT_PLATE_MAX_DETECTIONS: usize = 3;
const DEFAULT_SIGN_CADENCE: u64 = 15;
const DEFAULT_BLOCK_CADENCE: u64 = 30;
const DEFAULT_PLATE_BLUR: u32 = 51;
const DEFAULT_SIGN_BLUR: u32 = 21;
const DEFAULT_BLOCK_BLUR: u32 = 51;
const MAX_BLUR_KERNEL: u32 = 255;
const DEFAULT_OCR_LANGUAGE: &str = "eng";
const DEFAULT_QUEUE_DEPTH: usize = 2;
const DEFAULT_OUTPUT_DIR: &str = "streamsafe_output";
const DEFAULT_JOB_HISTORY: usize = 100;

#[derive(Debug, Deserialize, Default)]
struct StreamSafeConfigFile {
    api: Option<ApiConfigFile>,
    source: Option<SourceConfigFile>,
    detection: Option<DetectionSettings>,
    detectors: Option<DetectorsConfigFile>,
    live: Option<LiveConfigFile>,
    jobs: Option<JobsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    token_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    uri: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorsConfigFile {
    plate_model: Option<PathBuf>,
    plate_confidence: Option<f32>,
    plate_input_size: Option<u32>,
    plate_iou: Option<f32>,
    plate_max_detections: Option<usize>,
    sign_cadence: Option<u64>,
    block_cadence: Option<u64>,
    plate_blur_kernel: Option<u32>,
    sign_blur_kernel: Option<u32>,
    block_blur_kernel: Option<u32>,
    tessdata: Option<PathBuf>,
    ocr_language: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LiveConfigFile {
    queue_depth: Option<usize>,
    preview: Option<bool>,
    autostart: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct JobsConfigFile {
    output_dir: Option<PathBuf>,
    history_cap: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct StreamSafeConfig {
    pub api_addr: String,
    pub api_token_path: Option<PathBuf>,
    pub source: SourceSettings,
    /// Toggles applied to sessions that do not specify their own.
    pub detection: DetectionSettings,
    pub detectors: DetectorSettings,
    pub live: LiveSettings,
    pub jobs: JobSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub uri: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            uri: DEFAULT_SOURCE_URI.to_string(),
            target_fps: DEFAULT_SOURCE_FPS,
            width: DEFAULT_SOURCE_WIDTH,
            height: DEFAULT_SOURCE_HEIGHT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    /// ONNX plate model. Without one, fixed plate regions are blurred.
    pub plate_model: Option<PathBuf>,
    pub plate_confidence: f32,
    pub plate_input_size: u32,
    pub plate_iou: f32,
    pub plate_max_detections: usize,
    pub sign_cadence: u64,
    pub block_cadence: u64,
    pub plate_blur_kernel: u32,
    pub sign_blur_kernel: u32,
    pub block_blur_kernel: u32,
    pub tessdata: Option<PathBuf>,
    pub ocr_language: String,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            plate_model: None,
            plate_confidence: DEFAULT_PLATE_CONFIDENCE,
            plate_input_size: DEFAULT_PLATE_INPUT_SIZE,
            plate_iou: DEFAULT_PLATE_IOU,
            plate_max_detections: DEFAULT_PLATE_MAX_DETECTIONS,
            sign_cadence: DEFAULT_SIGN_CADENCE,
            block_cadence: DEFAULT_BLOCK_CADENCE,
            plate_blur_kernel: DEFAULT_PLATE_BLUR,
            sign_blur_kernel: DEFAULT_SIGN_BLUR,
            block_blur_kernel: DEFAULT_BLOCK_BLUR,
            tessdata: None,
            ocr_language: DEFAULT_OCR_LANGUAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveSettings {
    pub queue_depth: usize,
    /// Keep the latest original and redacted frames for preview.
    pub preview: bool,
    /// Start a session on the configured source when the daemon boots.
    pub autostart: bool,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            preview: true,
            autostart: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSettings {
    pub output_dir: PathBuf,
    pub history_cap: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            history_cap: DEFAULT_JOB_HISTORY,
        }
    }
}

impl Default for StreamSafeConfig {
    fn default() -> Self {
        Self {
            api_addr: DEFAULT_API_ADDR.to_string(),
            api_token_path: None,
            source: SourceSettings::default(),
            detection: DetectionSettings::default(),
            detectors: DetectorSettings::default(),
            live: LiveSettings::default(),
            jobs: JobSettings::default(),
        }
    }
}

impl StreamSafeConfig {
    /// Defaults, then the file named by `STREAMSAFE_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("STREAMSAFE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StreamSafeConfigFile) -> Self {
        let defaults = Self::default();
        let api = file.api.unwrap_or_default();
        let source = file.source.unwrap_or_default();
        let det = file.detectors.unwrap_or_default();
        let live = file.live.unwrap_or_default();
        let jobs = file.jobs.unwrap_or_default();
        let d = defaults.detectors;

        Self {
            api_addr: api.addr.unwrap_or(defaults.api_addr),
            api_token_path: api.token_path,
            source: SourceSettings {
                uri: source.uri.unwrap_or(defaults.source.uri),
                target_fps: source.target_fps.unwrap_or(defaults.source.target_fps),
                width: source.width.unwrap_or(defaults.source.width),
                height: source.height.unwrap_or(defaults.source.height),
            },
            detection: file.detection.unwrap_or_default(),
            detectors: DetectorSettings {
                plate_model: det.plate_model,
                plate_confidence: det.plate_confidence.unwrap_or(d.plate_confidence),
                plate_input_size: det.plate_input_size.unwrap_or(d.plate_input_size),
                plate_iou: det.plate_iou.unwrap_or(d.plate_iou),
                plate_max_detections: det.plate_max_detections.unwrap_or(d.plate_max_detections),
                sign_cadence: det.sign_cadence.unwrap_or(d.sign_cadence),
                block_cadence: det.block_cadence.unwrap_or(d.block_cadence),
                plate_blur_kernel: det.plate_blur_kernel.unwrap_or(d.plate_blur_kernel),
                sign_blur_kernel: det.sign_blur_kernel.unwrap_or(d.sign_blur_kernel),
                block_blur_kernel: det.block_blur_kernel.unwrap_or(d.block_blur_kernel),
                tessdata: det.tessdata,
                ocr_language: det.ocr_language.unwrap_or(d.ocr_language),
            },
            live: LiveSettings {
                queue_depth: live.queue_depth.unwrap_or(defaults.live.queue_depth),
                preview: live.preview.unwrap_or(defaults.live.preview),
                autostart: live.autostart.unwrap_or(defaults.live.autostart),
            },
            jobs: JobSettings {
                output_dir: jobs.output_dir.unwrap_or(defaults.jobs.output_dir),
                history_cap: jobs.history_cap.unwrap_or(defaults.jobs.history_cap),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("STREAMSAFE_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(path) = non_empty_env("STREAMSAFE_API_TOKEN_PATH") {
            self.api_token_path = Some(PathBuf::from(path));
        }
        if let Some(uri) = non_empty_env("STREAMSAFE_SOURCE") {
            self.source.uri = uri;
        }
        if let Some(path) = non_empty_env("STREAMSAFE_PLATE_MODEL") {
            self.detectors.plate_model = Some(PathBuf::from(path));
        }
        if let Some(kinds) = non_empty_env("STREAMSAFE_ENABLE") {
            self.detection = DetectionSettings::from_csv(&kinds)
                .map_err(|e| anyhow!("STREAMSAFE_ENABLE: {}", e))?;
        }
        if let Some(dir) = non_empty_env("STREAMSAFE_OUTPUT_DIR") {
            self.jobs.output_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.api_addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("api addr '{}' is not a socket address", self.api_addr))?;
        if self.source.uri.trim().is_empty() {
            return Err(anyhow!("source uri must not be empty"));
        }
        if self.source.target_fps == 0 {
            return Err(anyhow!("source target_fps must be greater than zero"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source width and height must be greater than zero"));
        }

        let det = &self.detectors;
        if !(det.plate_confidence > 0.0 && det.plate_confidence <= 1.0) {
            return Err(anyhow!("plate_confidence must be in (0, 1]"));
        }
        if !(det.plate_iou > 0.0 && det.plate_iou <= 1.0) {
            return Err(anyhow!("plate_iou must be in (0, 1]"));
        }
        if det.plate_input_size == 0 || det.plate_input_size % 32 != 0 {
            return Err(anyhow!("plate_input_size must be a positive multiple of 32"));
        }
        if det.plate_max_detections == 0 {
            return Err(anyhow!("plate_max_detections must be greater than zero"));
        }
        if det.sign_cadence == 0 || det.block_cadence == 0 {
            return Err(anyhow!("detector cadences must be greater than zero"));
        }
        for (name, kernel) in [
            ("plate_blur_kernel", det.plate_blur_kernel),
            ("sign_blur_kernel", det.sign_blur_kernel),
            ("block_blur_kernel", det.block_blur_kernel),
        ] {
            if kernel == 0 || kernel % 2 == 0 {
                return Err(anyhow!("{} must be a positive odd number", name));
            }
            if kernel > MAX_BLUR_KERNEL {
                return Err(anyhow!("{} must be at most {}", name, MAX_BLUR_KERNEL));
            }
        }

        if self.live.queue_depth == 0 {
            return Err(anyhow!("live queue_depth must be greater than zero"));
        }
        if self.jobs.history_cap == 0 {
            return Err(anyhow!("jobs history_cap must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<StreamSafeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}
