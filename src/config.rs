use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::PipelineError;

const DEFAULT_STORAGE_DIR: &str = "pet-door-data";
const DEFAULT_SOURCE_URL: &str = "stub://front_door";
const DEFAULT_API_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_CLASSIFIER: &str = "stub";
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_FPS: u32 = 2;
const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;
const DEFAULT_HIGH_WATER_MARK_GB: f64 = 10.0;
const DEFAULT_DETECTION_CONFIDENCE: f32 = 0.5;
const DEFAULT_MOTION_THRESHOLD_PERCENT: f32 = 30.0;
const DEFAULT_COOLDOWN_SECS: f64 = 5.0;

pub const MAX_FPS: u32 = 30;

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    storage_path: Option<PathBuf>,
    api_addr: Option<String>,
    source: Option<SourceConfigFile>,
    classifier: Option<ClassifierConfigFile>,
    pipeline: Option<PipelineConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ClassifierConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    detection_confidence: Option<f32>,
    motion_threshold_percent: Option<f32>,
    cooldown_seconds: Option<f64>,
    high_water_mark_gb: Option<f64>,
    save_on_motion_without_detection: Option<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Tunables read by every tick.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PipelineConfig {
    pub fps: u32,
    pub resolution: Resolution,
    pub detection_confidence: f32,
    pub motion_threshold_percent: f32,
    pub cooldown_seconds: f64,
    pub high_water_mark_gb: f64,
    /// Persist motion events even when the classifier found no cat or dog.
    pub save_on_motion_without_detection: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            resolution: Resolution {
                width: DEFAULT_WIDTH,
                height: DEFAULT_HEIGHT,
            },
            detection_confidence: DEFAULT_DETECTION_CONFIDENCE,
            motion_threshold_percent: DEFAULT_MOTION_THRESHOLD_PERCENT,
            cooldown_seconds: DEFAULT_COOLDOWN_SECS,
            high_water_mark_gb: DEFAULT_HIGH_WATER_MARK_GB,
            save_on_motion_without_detection: true,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        validate_fps(self.fps)?;
        validate_high_water_mark(self.high_water_mark_gb)?;
        validate_confidence(self.detection_confidence)?;
        if !(0.0..=100.0).contains(&self.motion_threshold_percent) {
            return Err(PipelineError::ConfigRejected(format!(
                "motion threshold must be within 0..=100 percent, got {}",
                self.motion_threshold_percent
            )));
        }
        if !self.cooldown_seconds.is_finite() || self.cooldown_seconds < 0.0 {
            return Err(PipelineError::ConfigRejected(format!(
                "cooldown must be a non-negative number of seconds, got {}",
                self.cooldown_seconds
            )));
        }
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(PipelineError::ConfigRejected(
                "resolution must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn high_water_mark_bytes(&self) -> u64 {
        gb_to_bytes(self.high_water_mark_gb)
    }
}

pub fn validate_fps(fps: u32) -> Result<(), PipelineError> {
    if fps == 0 || fps > MAX_FPS {
        return Err(PipelineError::ConfigRejected(format!(
            "fps must be within 1..={}, got {}",
            MAX_FPS, fps
        )));
    }
    Ok(())
}

pub fn validate_high_water_mark(gb: f64) -> Result<(), PipelineError> {
    if !gb.is_finite() || gb <= 0.0 {
        return Err(PipelineError::ConfigRejected(format!(
            "high water mark must be a positive number of GB, got {}",
            gb
        )));
    }
    Ok(())
}

pub fn validate_confidence(confidence: f32) -> Result<(), PipelineError> {
    if !(0.0..=1.0).contains(&confidence) {
        return Err(PipelineError::ConfigRejected(format!(
            "detection confidence must be within 0..=1, got {}",
            confidence
        )));
    }
    Ok(())
}

pub fn gb_to_bytes(gb: f64) -> u64 {
    (gb * 1024f64.powi(3)) as u64
}

pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / 1024f64.powi(3)
}

#[derive(Clone, Debug)]
pub struct ClassifierSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
}

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub storage_path: PathBuf,
    pub api_addr: String,
    pub source_url: String,
    pub classifier: ClassifierSettings,
    pub pipeline: PipelineConfig,
}

impl MonitorConfig {
    /// Load from `PETDOOR_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PETDOOR_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from an explicit file (or defaults), then apply environment overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Self {
        let storage_path = file.storage_path.unwrap_or_else(default_storage_path);
        let api_addr = file
            .api_addr
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let source_url = file
            .source
            .and_then(|source| source.url)
            .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string());
        let classifier_file = file.classifier.unwrap_or_default();
        let classifier = ClassifierSettings {
            backend: classifier_file
                .backend
                .unwrap_or_else(|| DEFAULT_CLASSIFIER.to_string()),
            model_path: classifier_file.model_path,
            input_size: classifier_file.input_size.unwrap_or(DEFAULT_MODEL_INPUT),
        };
        let p = file.pipeline.unwrap_or_default();
        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            fps: p.fps.unwrap_or(defaults.fps),
            resolution: Resolution {
                width: p.width.unwrap_or(defaults.resolution.width),
                height: p.height.unwrap_or(defaults.resolution.height),
            },
            detection_confidence: p
                .detection_confidence
                .unwrap_or(defaults.detection_confidence),
            motion_threshold_percent: p
                .motion_threshold_percent
                .unwrap_or(defaults.motion_threshold_percent),
            cooldown_seconds: p.cooldown_seconds.unwrap_or(defaults.cooldown_seconds),
            high_water_mark_gb: p.high_water_mark_gb.unwrap_or(defaults.high_water_mark_gb),
            save_on_motion_without_detection: p
                .save_on_motion_without_detection
                .unwrap_or(defaults.save_on_motion_without_detection),
        };
        Self {
            storage_path,
            api_addr,
            source_url,
            classifier,
            pipeline,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_nonempty("PETDOOR_STORAGE_PATH") {
            self.storage_path = PathBuf::from(path);
        }
        if let Some(url) = env_nonempty("PETDOOR_SOURCE") {
            self.source_url = url;
        }
        if let Some(addr) = env_nonempty("PETDOOR_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(backend) = env_nonempty("PETDOOR_CLASSIFIER") {
            self.classifier.backend = backend;
        }
        if let Some(path) = env_nonempty("PETDOOR_MODEL_PATH") {
            self.classifier.model_path = Some(PathBuf::from(path));
        }
        if let Some(fps) = env_nonempty("PETDOOR_FPS") {
            self.pipeline.fps = fps
                .parse()
                .map_err(|_| anyhow!("PETDOOR_FPS must be an integer"))?;
        }
        if let Some(gb) = env_nonempty("PETDOOR_HIGH_WATER_MARK_GB") {
            self.pipeline.high_water_mark_gb = gb
                .parse()
                .map_err(|_| anyhow!("PETDOOR_HIGH_WATER_MARK_GB must be a number"))?;
        }
        if let Some(conf) = env_nonempty("PETDOOR_DETECTION_CONFIDENCE") {
            self.pipeline.detection_confidence = conf
                .parse()
                .map_err(|_| anyhow!("PETDOOR_DETECTION_CONFIDENCE must be a number"))?;
        }
        if let Some(secs) = env_nonempty("PETDOOR_COOLDOWN_SECS") {
            self.pipeline.cooldown_seconds = secs
                .parse()
                .map_err(|_| anyhow!("PETDOOR_COOLDOWN_SECS must be a number of seconds"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        if self.storage_path.as_os_str().is_empty() {
            return Err(anyhow!("storage path cannot be empty"));
        }
        if self.classifier.input_size == 0 {
            return Err(anyhow!("classifier input size must be non-zero"));
        }
        Ok(())
    }
}

/// Process-wide pipeline config with validated runtime setters.
///
/// The orchestrator takes a snapshot at the top of each tick; the management
/// interface mutates it through the setters. A rejected value leaves the prior
/// one in place.
#[derive(Clone, Debug)]
pub struct SharedConfig {
    inner: Arc<Mutex<PipelineConfig>>,
}

impl SharedConfig {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(config)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipelineConfig> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> PipelineConfig {
        self.lock().clone()
    }

    pub fn fps(&self) -> u32 {
        self.lock().fps
    }

    pub fn set_fps(&self, fps: u32) -> Result<(), PipelineError> {
        validate_fps(fps)?;
        self.lock().fps = fps;
        Ok(())
    }

    pub fn high_water_mark_gb(&self) -> f64 {
        self.lock().high_water_mark_gb
    }

    pub fn set_high_water_mark_gb(&self, gb: f64) -> Result<(), PipelineError> {
        validate_high_water_mark(gb)?;
        self.lock().high_water_mark_gb = gb;
        Ok(())
    }

    pub fn detection_confidence(&self) -> f32 {
        self.lock().detection_confidence
    }

    pub fn set_detection_confidence(&self, confidence: f32) -> Result<(), PipelineError> {
        validate_confidence(confidence)?;
        self.lock().detection_confidence = confidence;
        Ok(())
    }
}

fn default_storage_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_STORAGE_DIR))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR))
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
