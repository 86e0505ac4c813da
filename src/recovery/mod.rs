//! Error classification and bounded recovery
//!
//! Every external call site reports its failures here. A failure is counted
//! against its [`ErrorCategory`]; while the consecutive count stays within
//! the retry ceiling one recovery strategy runs for that category. Recovered
//! resources are handed back through [`RecoveryContext`] and the caller
//! decides whether to adopt them.

pub mod shutdown;
pub mod validator;

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::audio::{SpeechEngine, SpeechFactory};
use crate::capture::frame::Frame;
use crate::capture::CameraFactory;
use crate::config::AppConfig;
use crate::vision::detection::{Detector, DetectorFactory};
use crate::vision::ocr::TextExtractor;

pub use shutdown::ShutdownRegistry;
pub use validator::{StartupValidator, ValidationResult, ValidationStatus};

/// Failure taxonomy, one recovery strategy per variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorCategory {
    /// Frame source unreachable or a read failed
    Camera,
    /// Detector unavailable or inference failed
    Model,
    /// Speech engine unavailable or a call failed
    Tts,
    /// Text extraction unavailable or failed
    Ocr,
    /// Anything unclassified in the main loop
    General,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 5] = [
        ErrorCategory::Camera,
        ErrorCategory::Model,
        ErrorCategory::Tts,
        ErrorCategory::Ocr,
        ErrorCategory::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Camera => "camera",
            ErrorCategory::Model => "model",
            ErrorCategory::Tts => "tts",
            ErrorCategory::Ocr => "ocr",
            ErrorCategory::General => "general",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Degraded output mode chosen when the speech engine cannot be restored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechFallback {
    /// Emit spoken messages as text
    Print,
}

/// Information passed into a recovery attempt and resources handed back from it
#[derive(Default)]
pub struct RecoveryContext {
    /// Camera index in use when the failure happened
    pub camera_index: Option<usize>,
    /// Free-form description of the failing operation
    pub detail: Option<String>,
    /// First probed camera index that opened and produced a frame
    pub recovered_camera_index: Option<usize>,
    /// Freshly loaded detector
    pub recovered_model: Option<Box<dyn Detector>>,
    /// Freshly created speech engine
    pub recovered_speech: Option<Box<dyn SpeechEngine>>,
    /// Set when speech could not be restored and text output should be used
    pub speech_fallback: Option<SpeechFallback>,
}

impl RecoveryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera_index(mut self, index: usize) -> Self {
        self.camera_index = Some(index);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Debug for RecoveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryContext")
            .field("camera_index", &self.camera_index)
            .field("detail", &self.detail)
            .field("recovered_camera_index", &self.recovered_camera_index)
            .field("recovered_model", &self.recovered_model.is_some())
            .field("recovered_speech", &self.recovered_speech.is_some())
            .field("speech_fallback", &self.speech_fallback)
            .finish()
    }
}

/// Collaborator factories the recovery strategies use to rebuild resources
#[derive(Default, Clone)]
pub struct RecoveryHooks {
    pub cameras: Option<Arc<dyn CameraFactory>>,
    pub detectors: Option<Arc<dyn DetectorFactory>>,
    pub speech: Option<Arc<dyn SpeechFactory>>,
    pub text: Option<Arc<dyn TextExtractor>>,
}

/// Retry ceiling and pauses used by the strategies
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub camera_pause: Duration,
    pub ocr_pause: Duration,
    pub general_pause: Duration,
    pub camera_probe_indices: Vec<usize>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for RecoveryConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_retries: config.runtime.max_retries,
            camera_pause: Duration::from_millis(config.runtime.camera_recovery_pause_ms),
            ocr_pause: Duration::from_millis(config.runtime.ocr_recovery_pause_ms),
            general_pause: Duration::from_millis(config.runtime.general_recovery_pause_ms),
            camera_probe_indices: config.camera.probe_indices.clone(),
        }
    }
}

impl RecoveryConfig {
    /// Same ceiling, no pauses
    pub fn without_pauses(mut self) -> Self {
        self.camera_pause = Duration::ZERO;
        self.ocr_pause = Duration::ZERO;
        self.general_pause = Duration::ZERO;
        self
    }
}

/// Centralized error counting and recovery dispatch
pub struct ErrorHandler {
    counts: Mutex<BTreeMap<ErrorCategory, u32>>,
    hooks: RwLock<RecoveryHooks>,
    config: RecoveryConfig,
}

impl ErrorHandler {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            counts: Mutex::new(BTreeMap::new()),
            hooks: RwLock::new(RecoveryHooks::default()),
            config,
        }
    }

    pub fn with_hooks(self, hooks: RecoveryHooks) -> Self {
        *self.hooks.write() = hooks;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Count a failure and run the category's recovery strategy.
    ///
    /// Returns `false` without attempting recovery once the consecutive
    /// count exceeds the retry ceiling, and `false` when the strategy
    /// itself fails. A `true` only means the strategy completed; callers
    /// still look in `context` for recovered resources.
    pub fn handle_error(
        &self,
        category: ErrorCategory,
        error: &dyn fmt::Display,
        context: &mut RecoveryContext,
    ) -> bool {
        error!("Error occurred: {} - {}", category, error);
        if let Some(detail) = &context.detail {
            error!("Context: {}", detail);
        }

        let count = {
            let mut counts = self.counts.lock();
            let count = counts.entry(category).or_insert(0);
            *count += 1;
            *count
        };

        if count > self.config.max_retries {
            error!("Max retries exceeded for {} ({} consecutive failures)", category, count);
            return false;
        }

        let hooks = self.hooks.read().clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match category {
            ErrorCategory::Camera => self.recover_camera(&hooks, context),
            ErrorCategory::Model => self.recover_model(&hooks, context),
            ErrorCategory::Tts => self.recover_tts(&hooks, context),
            ErrorCategory::Ocr => self.recover_ocr(&hooks),
            ErrorCategory::General => self.recover_general(),
        }));

        match outcome {
            Ok(handled) => handled,
            Err(_) => {
                error!("Recovery strategy for {} panicked", category);
                false
            }
        }
    }

    /// A success of `category` clears its consecutive failure count
    pub fn record_success(&self, category: ErrorCategory) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(&category) {
            if *count > 0 {
                debug!("{} recovered after {} failures", category, count);
            }
            *count = 0;
        }
    }

    /// Reset the counter of one category
    pub fn reset(&self, category: ErrorCategory) {
        self.counts.lock().remove(&category);
    }

    /// Current consecutive failure count of a category
    pub fn error_count(&self, category: ErrorCategory) -> u32 {
        self.counts.lock().get(&category).copied().unwrap_or(0)
    }

    /// Snapshot of all non-zero counters
    pub fn error_summary(&self) -> BTreeMap<ErrorCategory, u32> {
        self.counts
            .lock()
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(category, count)| (*category, *count))
            .collect()
    }

    fn recover_camera(&self, hooks: &RecoveryHooks, context: &mut RecoveryContext) -> bool {
        info!("Attempting camera recovery...");
        pause(self.config.camera_pause);

        let Some(cameras) = &hooks.cameras else {
            error!("Camera recovery failed: no camera factory registered");
            return false;
        };

        for &index in &self.config.camera_probe_indices {
            match cameras.open(index) {
                Ok(mut device) => {
                    let frame = device.read();
                    device.close();
                    match frame {
                        Ok(Some(frame)) if frame.is_valid() => {
                            info!("Camera recovery successful with index {}", index);
                            context.recovered_camera_index = Some(index);
                            return true;
                        }
                        Ok(_) => debug!("Camera index {} opened but produced no frame", index),
                        Err(e) => debug!("Camera index {} read failed: {}", index, e),
                    }
                }
                Err(e) => debug!("Camera index {} failed: {}", index, e),
            }
        }

        error!("Camera recovery failed");
        false
    }

    fn recover_model(&self, hooks: &RecoveryHooks, context: &mut RecoveryContext) -> bool {
        info!("Attempting model recovery...");
        let Some(detectors) = &hooks.detectors else {
            error!("Model recovery failed: no detector factory registered");
            return false;
        };

        match detectors.load() {
            Ok(detector) => {
                info!("Model recovery successful");
                context.recovered_model = Some(detector);
                true
            }
            Err(e) => {
                error!("Model recovery failed: {:#}", e);
                false
            }
        }
    }

    fn recover_tts(&self, hooks: &RecoveryHooks, context: &mut RecoveryContext) -> bool {
        info!("Attempting TTS recovery...");
        let created = match &hooks.speech {
            Some(speech) => speech.create(),
            None => Err(anyhow::anyhow!("no speech factory registered")),
        };

        match created {
            Ok(engine) => {
                info!("TTS recovery successful");
                context.recovered_speech = Some(engine);
            }
            Err(e) => {
                error!("TTS recovery failed: {:#}", e);
                info!("Using print fallback for TTS");
                context.speech_fallback = Some(SpeechFallback::Print);
            }
        }
        true
    }

    fn recover_ocr(&self, hooks: &RecoveryHooks) -> bool {
        info!("Attempting OCR recovery...");
        pause(self.config.ocr_pause);

        let Some(text) = &hooks.text else {
            error!("OCR recovery failed: no text extractor registered");
            return false;
        };

        let probe = Frame::filled(200, 50, 255, 0);
        match text.extract(&probe) {
            Ok(_) => {
                info!("OCR recovery successful");
                true
            }
            Err(e) => {
                error!("OCR recovery failed: {:#}", e);
                false
            }
        }
    }

    fn recover_general(&self) -> bool {
        info!("Attempting general recovery...");
        pause(self.config.general_pause);
        true
    }
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}
