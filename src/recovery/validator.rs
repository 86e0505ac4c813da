//! Startup dependency validation
//!
//! Runs an ordered list of independent checks before the loop starts. Any
//! critical failure blocks startup; warnings are logged and tolerated.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use tracing::{error, info, warn};

use super::RecoveryHooks;
use crate::capture::frame::Frame;
use crate::config::AppConfig;

/// Outcome class of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Success,
    Warning,
    CriticalFailure,
}

impl ValidationStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            ValidationStatus::Success => "✓",
            ValidationStatus::Warning => "⚠",
            ValidationStatus::CriticalFailure => "✗",
        }
    }
}

/// Result of one startup check
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub status: ValidationStatus,
    pub message: String,
    pub details: Value,
}

impl ValidationResult {
    pub fn success(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: ValidationStatus::Success,
            message: message.into(),
            details,
        }
    }

    pub fn warning(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: ValidationStatus::Warning,
            message: message.into(),
            details,
        }
    }

    pub fn critical(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: ValidationStatus::CriticalFailure,
            message: message.into(),
            details,
        }
    }
}

type Check = Box<dyn Fn() -> Result<ValidationResult>>;

/// Ordered collection of startup checks
pub struct StartupValidator {
    checks: Vec<(String, Check)>,
    results: Vec<(String, ValidationResult)>,
}

impl StartupValidator {
    pub fn new() -> Self {
        Self {
            checks: Vec::new(),
            results: Vec::new(),
        }
    }

    /// The checks run before the perception loop starts, in order
    pub fn standard(config: &AppConfig, hooks: &RecoveryHooks) -> Self {
        let mut validator = Self::new();

        validator.add_check("platform", || Ok(check_platform(std::env::consts::OS)));

        let cameras = hooks.cameras.clone();
        let camera_index = config.camera.index;
        validator.add_check("camera", move || {
            let Some(cameras) = &cameras else {
                return Ok(ValidationResult::critical(
                    "No frame source configured",
                    json!({ "camera_index": camera_index }),
                ));
            };
            let mut device = match cameras.open(camera_index) {
                Ok(device) => device,
                Err(e) => {
                    return Ok(ValidationResult::critical(
                        format!("Cannot access camera: {e:#}"),
                        json!({ "camera_index": camera_index }),
                    ))
                }
            };
            let frame = device.read();
            device.close();
            Ok(match frame {
                Ok(Some(frame)) if frame.is_valid() => ValidationResult::success(
                    "Camera access validated successfully",
                    json!({ "camera_index": camera_index, "frame_shape": [frame.width, frame.height] }),
                ),
                Ok(_) => ValidationResult::critical(
                    "Camera accessible but cannot capture frames",
                    json!({ "camera_index": camera_index }),
                ),
                Err(e) => ValidationResult::critical(
                    format!("Camera validation failed: {e:#}"),
                    json!({ "camera_index": camera_index }),
                ),
            })
        });

        let text = hooks.text.clone();
        validator.add_check("ocr", move || {
            let Some(text) = &text else {
                return Ok(ValidationResult::critical("No OCR engine configured", Value::Null));
            };
            let probe = Frame::filled(300, 100, 255, 0);
            Ok(match text.extract(&probe) {
                Ok(_) => ValidationResult::success("OCR engine is reachable", Value::Null),
                Err(e) => ValidationResult::critical(
                    format!("OCR engine not available: {e:#}"),
                    json!({ "error": e.to_string() }),
                ),
            })
        });

        let speech = hooks.speech.clone();
        let audio_enabled = config.audio.enabled;
        validator.add_check("tts", move || {
            if !audio_enabled {
                return Ok(ValidationResult::warning(
                    "Speech output disabled - messages will be printed",
                    Value::Null,
                ));
            }
            let Some(speech) = &speech else {
                return Ok(ValidationResult::warning(
                    "No speech engine available - messages will be printed",
                    Value::Null,
                ));
            };
            Ok(match speech.create() {
                Ok(engine) => ValidationResult::success(
                    "TTS engine initialized successfully",
                    json!({ "engine": engine.name() }),
                ),
                Err(e) => ValidationResult::warning(
                    format!("TTS engine has issues, text fallback will be used: {e:#}"),
                    json!({ "error": e.to_string() }),
                ),
            })
        });

        let detectors = hooks.detectors.clone();
        let model_path = config.detection.model_path.clone();
        validator.add_check("models", move || {
            let Some(detectors) = &detectors else {
                return Ok(ValidationResult::critical(
                    "No detector configured",
                    json!({ "model": model_path }),
                ));
            };
            Ok(match detectors.load() {
                Ok(_) => ValidationResult::success("Detection model loaded successfully", json!({ "model": model_path })),
                Err(e) => ValidationResult::warning(
                    format!("Model loading issue, detection disabled until it loads: {e:#}"),
                    json!({ "model": model_path, "error": e.to_string() }),
                ),
            })
        });

        let required_dirs = config.storage.required_dirs.clone();
        validator.add_check("directories", move || Ok(check_directories(&required_dirs)));

        validator.add_check("permissions", || Ok(check_permissions(PathBuf::from("."))));

        validator
    }

    /// Append a named check
    pub fn add_check<F>(&mut self, name: impl Into<String>, check: F)
    where
        F: Fn() -> Result<ValidationResult> + 'static,
    {
        self.checks.push((name.into(), Box::new(check)));
    }

    /// Run every check in order. True when none failed critically.
    pub fn validate_all(&mut self) -> bool {
        info!("Starting system validation...");
        self.results.clear();

        let mut all_passed = true;
        for (name, check) in &self.checks {
            let result = match panic::catch_unwind(AssertUnwindSafe(check)) {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => ValidationResult::critical(
                    format!("Validation failed with error: {e:#}"),
                    json!({ "error": format!("{e:?}") }),
                ),
                Err(_) => ValidationResult::critical("Validation check panicked", Value::Null),
            };

            match result.status {
                ValidationStatus::CriticalFailure => {
                    all_passed = false;
                    error!("Critical validation failure: {} - {}", name, result.message);
                }
                ValidationStatus::Warning => warn!("Validation warning: {} - {}", name, result.message),
                ValidationStatus::Success => info!("Validation passed: {}", name),
            }
            self.results.push((name.clone(), result));
        }

        if all_passed {
            info!("All system validations passed");
        } else {
            error!("Some critical validations failed");
        }
        all_passed
    }

    /// Results of the last run, in check order
    pub fn results(&self) -> &[(String, ValidationResult)] {
        &self.results
    }

    /// Human-readable report of the last run
    pub fn report(&self) -> String {
        let mut lines = vec!["System Validation Report".to_string(), "=".repeat(30)];
        for (name, result) in &self.results {
            lines.push(format!(
                "{} {}: {}",
                result.status.symbol(),
                name.to_uppercase(),
                result.message
            ));
        }
        lines.join("\n")
    }
}

impl Default for StartupValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn check_platform(os: &str) -> ValidationResult {
    match os {
        "windows" | "macos" => ValidationResult::success(
            format!("Platform {os} is fully supported"),
            json!({ "platform": os, "arch": std::env::consts::ARCH }),
        ),
        "linux" => ValidationResult::warning(
            "Linux platform has limited support - some features may not work optimally",
            json!({ "platform": os }),
        ),
        other => ValidationResult::critical(format!("Platform {other} is not supported"), json!({ "platform": other })),
    }
}

fn check_directories(dirs: &[PathBuf]) -> ValidationResult {
    let mut created = Vec::new();
    let mut failed = Vec::new();

    for dir in dirs {
        match crate::storage::ensure_dir(dir) {
            Ok(()) => created.push(dir.display().to_string()),
            Err(e) => failed.push(format!("{} ({e:#})", dir.display())),
        }
    }

    if failed.is_empty() {
        ValidationResult::success("All required directories validated", json!({ "directories": created }))
    } else {
        ValidationResult::warning(
            format!("Some directories could not be created: {failed:?}"),
            json!({ "failed": failed, "created": created }),
        )
    }
}

fn check_permissions(dir: PathBuf) -> ValidationResult {
    let probe = || -> Result<()> {
        let mut file = tempfile::NamedTempFile::new_in(&dir).context("create probe file")?;
        file.write_all(b"test").context("write probe file")?;
        Ok(())
    };

    match probe() {
        Ok(()) => ValidationResult::success("File system permissions validated", json!({ "write_access": true })),
        Err(e) => ValidationResult::warning(format!("Permission issues detected: {e:#}"), json!({ "write_access": false })),
    }
}
