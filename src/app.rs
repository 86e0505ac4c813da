//! Application Coordinator
//!
//! Runs the cooperative perception loop on the main thread: capture a
//! frame, poll input, hand OCR requests to the pipeline, run detection on
//! every Nth frame and speak proximity alerts. The OCR worker is the only
//! background thread the loop talks to, and it never waits for it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::analysis::{AlertCooldownTable, SceneAnnouncer};
use crate::audio::AudioGate;
use crate::capture::FrameSource;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::input::{InputEvent, InputSource};
use crate::recovery::{ErrorCategory, ErrorHandler, RecoveryContext, ShutdownRegistry};
use crate::vision::detection::filter_close;
use crate::vision::{ObjectDetector, OcrPipeline};

/// State owned by the loop and shared with its collaborators
pub struct RuntimeContext {
    pub errors: Arc<ErrorHandler>,
    pub alerts: AlertCooldownTable,
    pub shutdown: Arc<ShutdownRegistry>,
    pub clock: Arc<dyn Clock>,
}

impl RuntimeContext {
    pub fn new(
        config: &AppConfig,
        errors: Arc<ErrorHandler>,
        shutdown: Arc<ShutdownRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            errors,
            alerts: AlertCooldownTable::new(config.alerts.cooldown()),
            shutdown,
            clock,
        }
    }
}

/// Loop policy constants
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub frame_skip: u64,
    pub proximity_threshold: f32,
    pub max_consecutive_failures: u32,
    pub retry_delay: Duration,
    pub tick_delay: Duration,
    pub input_poll: Duration,
}

impl From<&AppConfig> for LoopSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            frame_skip: config.detection.frame_skip.max(1),
            proximity_threshold: config.detection.proximity_threshold,
            max_consecutive_failures: config.camera.max_consecutive_failures,
            retry_delay: Duration::from_millis(config.camera.retry_delay_ms),
            tick_delay: Duration::from_millis(config.runtime.tick_delay_ms),
            input_poll: Duration::from_millis(config.runtime.input_poll_ms),
        }
    }
}

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The user asked to quit
    UserQuit,
    /// The shutdown flag was set (signal or explicit request)
    ShutdownRequested,
    /// Frames stopped arriving and reinitialization failed
    CameraLost,
    /// Unclassified failures exceeded the retry ceiling
    Fatal,
}

impl LoopExit {
    pub fn exit_code(&self) -> u8 {
        match self {
            LoopExit::UserQuit | LoopExit::ShutdownRequested => 0,
            LoopExit::CameraLost => 2,
            LoopExit::Fatal => 3,
        }
    }
}

/// Collaborators driven by the loop
pub struct Components {
    pub camera: FrameSource,
    pub detector: ObjectDetector,
    pub gate: Arc<AudioGate>,
    pub ocr: Arc<OcrPipeline>,
    pub input: Box<dyn InputSource>,
}

/// The main coordination loop
pub struct Coordinator {
    context: RuntimeContext,
    settings: LoopSettings,
    camera: FrameSource,
    detector: ObjectDetector,
    gate: Arc<AudioGate>,
    ocr: Arc<OcrPipeline>,
    input: Box<dyn InputSource>,
    scene: Option<SceneAnnouncer>,
    frame_count: u64,
    consecutive_failures: u32,
}

impl Coordinator {
    /// `components.camera` must already be initialized
    pub fn new(context: RuntimeContext, settings: LoopSettings, components: Components) -> Self {
        Self {
            context,
            settings,
            camera: components.camera,
            detector: components.detector,
            gate: components.gate,
            ocr: components.ocr,
            input: components.input,
            scene: None,
            frame_count: 0,
            consecutive_failures: 0,
        }
    }

    /// Enable scene announcements
    pub fn with_scene(mut self, scene: SceneAnnouncer) -> Self {
        self.scene = Some(scene);
        self
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.context
    }

    pub fn ocr(&self) -> &OcrPipeline {
        &self.ocr
    }

    pub fn camera_mut(&mut self) -> &mut FrameSource {
        &mut self.camera
    }

    /// Release the camera and unload the detection model
    pub fn release(&mut self) {
        self.camera.release();
        self.detector.unload();
    }

    /// Run ticks until one of them ends the loop
    pub fn run(&mut self) -> LoopExit {
        info!("VisionMate main loop started (Enter = read text, q = quit)");

        let exit = loop {
            match panic::catch_unwind(AssertUnwindSafe(|| self.tick())) {
                Ok(Some(exit)) => break exit,
                Ok(None) => self.context.errors.record_success(ErrorCategory::General),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!("Error in main loop: {}", message);
                    let mut context = RecoveryContext::new().with_detail(format!("main loop tick {}", self.frame_count));
                    if !self
                        .context
                        .errors
                        .handle_error(ErrorCategory::General, &message, &mut context)
                    {
                        error!("Too many errors in main loop, stopping");
                        break LoopExit::Fatal;
                    }
                }
            }
        };

        info!("Main loop ended: {:?} after {} frames", exit, self.frame_count);
        exit
    }

    /// One pass of the loop. `Some` ends the loop.
    pub fn tick(&mut self) -> Option<LoopExit> {
        if self.context.shutdown.is_shutdown_requested() {
            return Some(LoopExit::ShutdownRequested);
        }

        let Some(frame) = self.camera.get_frame() else {
            self.consecutive_failures += 1;
            warn!(
                "Failed to get frame ({}/{})",
                self.consecutive_failures, self.settings.max_consecutive_failures
            );
            if self.consecutive_failures >= self.settings.max_consecutive_failures {
                error!("Too many consecutive frame failures, attempting camera reinitialization");
                if !self.camera.reinitialize() {
                    error!("Camera reinitialization failed");
                    return Some(LoopExit::CameraLost);
                }
                self.consecutive_failures = 0;
            }
            sleep(self.settings.retry_delay);
            return None;
        };

        self.consecutive_failures = 0;
        let frame_index = self.frame_count;
        self.frame_count += 1;

        match self.input.poll(self.settings.input_poll) {
            Some(InputEvent::OcrTrigger) => {
                info!("OCR triggered by user");
                self.ocr.process_frame(&frame);
            }
            Some(InputEvent::Quit) => {
                info!("Quit requested by user");
                return Some(LoopExit::UserQuit);
            }
            None => {}
        }

        if frame_index % self.settings.frame_skip == 0 {
            let detections = self.detector.detect(&frame);
            let close = filter_close(&detections, frame.width, frame.height, self.settings.proximity_threshold);

            for detection in &close {
                let now = self.context.clock.now();
                if !self.context.alerts.is_ready(&detection.label, now) {
                    continue;
                }
                if self.gate.is_busy() || self.ocr.is_busy() {
                    debug!("Alert for {} deferred, audio or OCR busy", detection.label);
                    continue;
                }
                if self.gate.speak_alert(&detection.label) {
                    info!(
                        "Proximity alert: {} ({:.0}% of frame)",
                        detection.label,
                        100.0 * detection.area() / frame.area() as f32
                    );
                    self.context.alerts.stamp(&detection.label, now);
                }
            }
        }

        if let Some(scene) = self.scene.as_mut() {
            scene.process_frame(&frame, &self.gate);
        }

        sleep(self.settings.tick_delay);
        None
    }
}

fn sleep(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
