//! Analysis Layer
//!
//! Turns per-frame detections into announcements: proximity alert
//! debouncing and periodic scene announcements.

pub mod alerts;
pub mod scene;

pub use alerts::AlertCooldownTable;
pub use scene::{BrightnessSceneClassifier, SceneAnnouncer, SceneClassifier, ScenePrediction};
