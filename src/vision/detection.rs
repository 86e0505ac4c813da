//! Detection adapter
//!
//! Wraps a black-box [`Detector`] and turns its raw output into
//! [`Detection`] records restricted to the navigation classes the loop
//! announces. Inference failures are reported to the recovery subsystem and
//! surface as an empty list.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::capture::frame::Frame;
use crate::error::ConfigError;
use crate::recovery::{ErrorCategory, ErrorHandler, RecoveryContext};

/// Fraction of the frame area above which an object counts as close
pub const DEFAULT_PROXIMITY_THRESHOLD: f32 = 0.15;

/// Classes the detector output is filtered to
pub const TARGET_LABELS: [&str; 4] = ["person", "chair", "car", "door"];

/// Axis-aligned box in frame pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(b: [f32; 4]) -> Self {
        Self::new(b[0], b[1], b[2], b[3])
    }
}

/// One recognized object in one frame
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }

    pub fn area(&self) -> f32 {
        self.bbox.area()
    }

    /// True when the box covers more than `threshold` of the frame
    pub fn is_close(&self, frame_width: u32, frame_height: u32, threshold: f32) -> bool {
        let frame_area = frame_width as f32 * frame_height as f32;
        if frame_area <= 0.0 {
            return false;
        }
        self.area() / frame_area > threshold
    }
}

/// Detector output before filtering: label, confidence and `[x1, y1, x2, y2]`
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub label: String,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

/// Black-box object detector
pub trait Detector: Send {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>>;
}

/// Loads detectors, used at startup and by model recovery
pub trait DetectorFactory: Send + Sync {
    fn load(&self) -> Result<Box<dyn Detector>>;
}

/// Filters raw detector output for the main loop
pub struct ObjectDetector {
    model: Option<Box<dyn Detector>>,
    confidence_threshold: f32,
    errors: Arc<ErrorHandler>,
}

impl ObjectDetector {
    /// Fails when `confidence_threshold` is outside `[0, 1]`
    pub fn new(
        model: Option<Box<dyn Detector>>,
        confidence_threshold: f32,
        errors: Arc<ErrorHandler>,
    ) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(ConfigError::out_of_range(
                "detection.confidence_threshold",
                confidence_threshold,
                "[0, 1]",
            ));
        }

        if model.is_none() {
            warn!("Object detector created without a model; detection disabled until one loads");
        }

        Ok(Self {
            model,
            confidence_threshold,
            errors,
        })
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    /// Drop the loaded model
    pub fn unload(&mut self) {
        if self.model.take().is_some() {
            info!("Object detector cleaned up");
        }
    }

    /// Target-class detections at or above the confidence floor.
    ///
    /// Returns an empty list for malformed frames, a missing model, or a
    /// failed inference.
    pub fn detect(&mut self, frame: &Frame) -> Vec<Detection> {
        if !frame.is_valid() {
            warn!("Invalid frame provided, returning empty detection list");
            return Vec::new();
        }

        let Some(model) = self.model.as_mut() else {
            debug!("Model not initialized, returning empty detection list");
            return Vec::new();
        };

        match model.infer(frame) {
            Ok(raw) => {
                self.errors.record_success(ErrorCategory::Model);
                let detections: Vec<Detection> = raw
                    .into_iter()
                    .filter(|r| TARGET_LABELS.contains(&r.label.as_str()))
                    .filter(|r| r.confidence.is_finite() && r.confidence >= self.confidence_threshold)
                    .map(|r| Detection::new(r.label, r.confidence, r.bbox.into()))
                    .collect();
                debug!("Detected {} objects above threshold", detections.len());
                detections
            }
            Err(e) => {
                let mut context = RecoveryContext::new().with_detail(format!(
                    "inference on {}x{} frame {}",
                    frame.width, frame.height, frame.sequence
                ));
                if self.errors.handle_error(ErrorCategory::Model, &format!("{e:#}"), &mut context) {
                    if let Some(model) = context.recovered_model.take() {
                        self.model = Some(model);
                    }
                }
                Vec::new()
            }
        }
    }
}

/// Detection with the largest area; ties go to the first one seen
pub fn largest(detections: &[Detection]) -> Option<&Detection> {
    let mut best: Option<&Detection> = None;
    for detection in detections {
        match best {
            Some(current) if detection.area() <= current.area() => {}
            _ => best = Some(detection),
        }
    }
    best
}

/// Detections covering more than `threshold` of the frame
pub fn filter_close(detections: &[Detection], frame_width: u32, frame_height: u32, threshold: f32) -> Vec<Detection> {
    detections
        .iter()
        .filter(|d| d.is_close(frame_width, frame_height, threshold))
        .cloned()
        .collect()
}
