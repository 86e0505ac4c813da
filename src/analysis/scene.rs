//! Scene announcements
//!
//! A black-box [`SceneClassifier`] is consulted at a low, fixed rate. A
//! confident label that differs from the last announced one is spoken
//! through the audio gate.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audio::AudioGate;
use crate::capture::frame::Frame;
use crate::clock::Clock;
use crate::config::SceneSettings;

/// A scene label with its confidence
#[derive(Debug, Clone, PartialEq)]
pub struct ScenePrediction {
    pub label: String,
    pub confidence: f32,
}

/// Black-box scene classifier
pub trait SceneClassifier: Send {
    fn classify(&mut self, frame: &Frame) -> Result<Option<ScenePrediction>>;
}

/// Coarse guess from overall brightness and colour balance
#[derive(Debug, Default)]
pub struct BrightnessSceneClassifier;

impl SceneClassifier for BrightnessSceneClassifier {
    fn classify(&mut self, frame: &Frame) -> Result<Option<ScenePrediction>> {
        if !frame.is_valid() {
            return Ok(None);
        }

        let pixels = frame.area() as f32;
        let (mut r, mut g, mut b) = (0u64, 0u64, 0u64);
        for px in frame.data.chunks_exact(3) {
            r += px[0] as u64;
            g += px[1] as u64;
            b += px[2] as u64;
        }
        let (r, g, b) = (r as f32 / pixels, g as f32 / pixels, b as f32 / pixels);
        let brightness = 0.299 * r + 0.587 * g + 0.114 * b;

        let label = if brightness > 150.0 {
            if b / 255.0 > 0.6 {
                "outdoor"
            } else if g / 255.0 > 0.5 {
                "park"
            } else {
                "office"
            }
        } else if brightness > 100.0 {
            if r > g && r > b {
                "room"
            } else {
                "corridor"
            }
        } else {
            "street"
        };

        Ok(Some(ScenePrediction {
            label: label.to_string(),
            confidence: 0.5,
        }))
    }
}

/// Rate-limits classification and announces scene changes
pub struct SceneAnnouncer {
    classifier: Box<dyn SceneClassifier>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    confidence_threshold: f32,
    last_run: Option<Instant>,
    current: Option<String>,
    last_announced: Option<String>,
}

impl SceneAnnouncer {
    pub fn new(classifier: Box<dyn SceneClassifier>, clock: Arc<dyn Clock>, settings: &SceneSettings) -> Self {
        info!(
            "Scene announcements every {:.0}s (confidence >= {})",
            settings.update_interval_seconds, settings.confidence_threshold
        );
        Self {
            classifier,
            clock,
            interval: Duration::from_secs_f64(settings.update_interval_seconds),
            confidence_threshold: settings.confidence_threshold,
            last_run: None,
            current: None,
            last_announced: None,
        }
    }

    /// Most recent confident classification
    pub fn current_scene(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Classify if the interval elapsed; returns the label when it was announced
    pub fn process_frame(&mut self, frame: &Frame, gate: &AudioGate) -> Option<String> {
        let now = self.clock.now();
        if let Some(last) = self.last_run {
            if now.saturating_duration_since(last) < self.interval {
                return None;
            }
        }
        self.last_run = Some(now);

        let prediction = match self.classifier.classify(frame) {
            Ok(Some(prediction)) => prediction,
            Ok(None) => return None,
            Err(e) => {
                warn!("Error in scene processing: {:#}", e);
                return None;
            }
        };

        if prediction.confidence < self.confidence_threshold {
            debug!("Scene {} below confidence threshold", prediction.label);
            return None;
        }
        debug!("Scene classified as: {}", prediction.label);
        self.current = Some(prediction.label.clone());

        if self.last_announced.as_deref() == Some(prediction.label.as_str()) {
            return None;
        }
        if gate.is_busy() {
            debug!("Audio busy, skipping scene announcement");
            return None;
        }

        if gate.speak_scene(&prediction.label) {
            info!("Scene changed, announced: {}", prediction.label);
            self.last_announced = Some(prediction.label.clone());
            Some(prediction.label)
        } else {
            warn!("Failed to announce scene change");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::recovery::{ErrorHandler, RecoveryConfig};
    use crate::testing::{RecordingSpeechEngine, ScriptedScenes};

    fn gate() -> (AudioGate, Arc<parking_lot::Mutex<Vec<String>>>) {
        let engine = RecordingSpeechEngine::new();
        let spoken = engine.spoken();
        let errors = Arc::new(ErrorHandler::new(RecoveryConfig::default().without_pauses()));
        (AudioGate::new(Some(Box::new(engine)), errors), spoken)
    }

    fn announcer(scenes: Vec<(&str, f32)>, clock: Arc<ManualClock>) -> SceneAnnouncer {
        let settings = SceneSettings {
            enabled: true,
            update_interval_seconds: 15.0,
            confidence_threshold: 0.3,
        };
        SceneAnnouncer::new(Box::new(ScriptedScenes::new(scenes)), clock, &settings)
    }

    #[test]
    fn test_announces_changes_at_interval() {
        let clock = Arc::new(ManualClock::new());
        let (gate, spoken) = gate();
        let mut scenes = announcer(
            vec![("office", 0.9), ("office", 0.9), ("corridor", 0.8)],
            clock.clone(),
        );
        let frame = Frame::filled(4, 4, 0, 0);

        assert_eq!(scenes.process_frame(&frame, &gate).as_deref(), Some("office"));
        // inside the interval: classifier not consulted
        clock.advance_secs(5.0);
        assert_eq!(scenes.process_frame(&frame, &gate), None);
        // same scene again: not repeated
        clock.advance_secs(10.0);
        assert_eq!(scenes.process_frame(&frame, &gate), None);
        clock.advance_secs(15.0);
        assert_eq!(scenes.process_frame(&frame, &gate).as_deref(), Some("corridor"));

        assert_eq!(*spoken.lock(), vec!["Environment: office", "Environment: corridor"]);
    }

    #[test]
    fn test_low_confidence_is_ignored() {
        let clock = Arc::new(ManualClock::new());
        let (gate, spoken) = gate();
        let mut scenes = announcer(vec![("park", 0.1)], clock);

        assert_eq!(scenes.process_frame(&Frame::filled(4, 4, 0, 0), &gate), None);
        assert!(scenes.current_scene().is_none());
        assert!(spoken.lock().is_empty());
    }

    #[test]
    fn test_brightness_heuristic() {
        let mut classifier = BrightnessSceneClassifier;
        let dark = classifier.classify(&Frame::filled(4, 4, 20, 0)).unwrap().unwrap();
        assert_eq!(dark.label, "street");

        let mut sky = Frame::filled(2, 2, 0, 0);
        for px in sky.data.chunks_exact_mut(3) {
            px.copy_from_slice(&[140, 190, 250]);
        }
        assert_eq!(classifier.classify(&sky).unwrap().unwrap().label, "outdoor");

        assert!(classifier.classify(&Frame::new(vec![], 0, 0, 0)).unwrap().is_none());
    }
}
