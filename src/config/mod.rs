//! Application Configuration
//!
//! User settings stored in TOML format. Every value is validated at load
//! time; an out-of-range value is a startup error, never a runtime one.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Object detection settings
    pub detection: DetectionSettings,
    /// Proximity alert settings
    pub alerts: AlertSettings,
    /// Text reading settings
    pub ocr: OcrSettings,
    /// Frame source settings
    pub camera: CameraSettings,
    /// Speech output settings
    pub audio: AudioSettings,
    /// Scene announcement settings
    pub scene: SceneSettings,
    /// Main loop timing and recovery settings
    pub runtime: RuntimeSettings,
    /// Directory layout
    pub storage: StorageSettings,
}

/// Object detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// Minimum confidence for a detection to be kept (0.0 - 1.0)
    pub confidence_threshold: f32,
    /// Fraction of the frame area above which an object counts as close (0.0 - 1.0)
    pub proximity_threshold: f32,
    /// Run detection on every Nth frame
    pub frame_skip: u64,
    /// Path to the YOLO ONNX model
    pub model_path: PathBuf,
    /// Square model input size in pixels
    pub input_size: u32,
    /// IoU above which overlapping boxes of one class are suppressed
    pub nms_iou_threshold: f32,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            proximity_threshold: 0.15,
            frame_skip: 3,
            model_path: PathBuf::from("models/yolov8n.onnx"),
            input_size: 640,
            nms_iou_threshold: 0.45,
        }
    }
}

/// Proximity alert settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    /// Minimum seconds between two spoken alerts for the same class
    pub cooldown_seconds: f64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self { cooldown_seconds: 5.0 }
    }
}

impl AlertSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_seconds)
    }
}

/// Text reading settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    /// Minimum seconds between two accepted OCR requests
    pub cooldown_seconds: f64,
    /// Shortest text that is read aloud
    pub min_text_length: usize,
    /// Minimum share of printable characters (empirical, open to tuning)
    pub min_printable_ratio: f32,
    /// Minimum share of alphanumeric characters (empirical, open to tuning)
    pub min_alphanumeric_ratio: f32,
    /// Capacity of the request queue
    pub queue_capacity: usize,
    /// Upper bound for one extraction
    pub timeout_seconds: u64,
    /// Tesseract executable
    pub tesseract_cmd: String,
    /// Wait before retrying to speak a result when the gate is busy
    pub retry_speak_delay_ms: u64,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            cooldown_seconds: 2.0,
            min_text_length: 3,
            min_printable_ratio: 0.7,
            min_alphanumeric_ratio: 0.3,
            queue_capacity: 5,
            timeout_seconds: 10,
            tesseract_cmd: "tesseract".to_string(),
            retry_speak_delay_ms: 500,
        }
    }
}

impl OcrSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_seconds)
    }
}

/// Frame source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Camera index to open at startup
    pub index: usize,
    /// Frame sources addressed by camera index (image file or directory of frames)
    pub sources: Vec<PathBuf>,
    /// Indices tried, in order, when recovering a lost camera
    pub probe_indices: Vec<usize>,
    /// Consecutive failed reads before a forced reinitialization
    pub max_consecutive_failures: u32,
    /// Pause after a failed read
    pub retry_delay_ms: u64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            index: 0,
            sources: Vec::new(),
            probe_indices: vec![0, 1, 2],
            max_consecutive_failures: 10,
            retry_delay_ms: 100,
        }
    }
}

/// Speech output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Use the speech engine (false = text fallback only)
    pub enabled: bool,
    /// Words per minute
    pub speech_rate: u32,
    /// Override of the speech program (defaults per platform)
    pub command: Option<String>,
}

impl Default for AudioSettings {
    fn default() -> Self {
        let speech_rate = if cfg!(any(target_os = "windows", target_os = "macos")) {
            200
        } else {
            150
        };
        Self {
            enabled: true,
            speech_rate,
            command: None,
        }
    }
}

/// Scene announcement settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneSettings {
    pub enabled: bool,
    /// Seconds between two classifications
    pub update_interval_seconds: f64,
    /// Minimum confidence for an announcement (0.0 - 1.0)
    pub confidence_threshold: f32,
}

impl Default for SceneSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            update_interval_seconds: 15.0,
            confidence_threshold: 0.3,
        }
    }
}

/// Main loop timing and recovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Sleep at the end of every tick
    pub tick_delay_ms: u64,
    /// Upper bound for one input poll
    pub input_poll_ms: u64,
    /// Consecutive failures of one category before recovery stops
    pub max_retries: u32,
    pub camera_recovery_pause_ms: u64,
    pub ocr_recovery_pause_ms: u64,
    pub general_recovery_pause_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            tick_delay_ms: 10,
            input_poll_ms: 30,
            max_retries: 3,
            camera_recovery_pause_ms: 1000,
            ocr_recovery_pause_ms: 500,
            general_recovery_pause_ms: 100,
        }
    }
}

/// Directory layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directories created (and checked for writability) at startup
    pub required_dirs: Vec<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            required_dirs: ["test_data", "test_data/detection", "test_data/ocr", "evaluation", "models"]
                .iter()
                .map(PathBuf::from)
                .collect(),
        }
    }
}

impl AppConfig {
    /// Check every value against its allowed range
    pub fn validate(&self) -> Result<(), ConfigError> {
        unit_interval("detection.confidence_threshold", self.detection.confidence_threshold)?;
        unit_interval("detection.proximity_threshold", self.detection.proximity_threshold)?;
        unit_interval("detection.nms_iou_threshold", self.detection.nms_iou_threshold)?;
        if self.detection.frame_skip == 0 {
            return Err(ConfigError::out_of_range("detection.frame_skip", 0, "> 0"));
        }
        if self.detection.input_size == 0 || self.detection.input_size % 32 != 0 {
            return Err(ConfigError::out_of_range(
                "detection.input_size",
                self.detection.input_size,
                "a positive multiple of 32",
            ));
        }

        positive_secs("alerts.cooldown_seconds", self.alerts.cooldown_seconds)?;

        positive_secs("ocr.cooldown_seconds", self.ocr.cooldown_seconds)?;
        if self.ocr.min_text_length == 0 {
            return Err(ConfigError::out_of_range("ocr.min_text_length", 0, "> 0"));
        }
        unit_interval("ocr.min_printable_ratio", self.ocr.min_printable_ratio)?;
        unit_interval("ocr.min_alphanumeric_ratio", self.ocr.min_alphanumeric_ratio)?;
        if self.ocr.queue_capacity == 0 {
            return Err(ConfigError::out_of_range("ocr.queue_capacity", 0, "> 0"));
        }
        if self.ocr.timeout_seconds == 0 {
            return Err(ConfigError::out_of_range("ocr.timeout_seconds", 0, "> 0"));
        }

        if self.camera.max_consecutive_failures == 0 {
            return Err(ConfigError::out_of_range("camera.max_consecutive_failures", 0, "> 0"));
        }

        if self.scene.enabled {
            positive_secs("scene.update_interval_seconds", self.scene.update_interval_seconds)?;
        }
        unit_interval("scene.confidence_threshold", self.scene.confidence_threshold)?;

        if self.runtime.input_poll_ms > 30 {
            return Err(ConfigError::out_of_range(
                "runtime.input_poll_ms",
                self.runtime.input_poll_ms,
                "[0, 30]",
            ));
        }

        Ok(())
    }
}

fn unit_interval(field: &'static str, value: f32) -> Result<(), ConfigError> {
    // NaN fails both comparisons
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::out_of_range(field, value, "[0, 1]"))
    }
}

fn positive_secs(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::out_of_range(field, value, "> 0"))
    }
}

/// Load and validate configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
