//! Error types shared across the perception loop

use thiserror::Error;

use crate::recovery::ErrorCategory;

/// Invalid or unreadable configuration. Always fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} must be in {allowed}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: String,
        allowed: &'static str,
    },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl ConfigError {
    pub(crate) fn out_of_range(field: &'static str, value: impl ToString, allowed: &'static str) -> Self {
        ConfigError::OutOfRange {
            field,
            value: value.to_string(),
            allowed,
        }
    }
}

/// Failure reported by one of the black-box collaborators
#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Speech error: {0}")]
    Speech(String),

    #[error("OCR error: {0}")]
    Ocr(String),
}

impl CollaboratorError {
    /// Recovery category this failure is routed to
    pub fn category(&self) -> ErrorCategory {
        match self {
            CollaboratorError::Camera(_) => ErrorCategory::Camera,
            CollaboratorError::Model(_) => ErrorCategory::Model,
            CollaboratorError::Speech(_) => ErrorCategory::Tts,
            CollaboratorError::Ocr(_) => ErrorCategory::Ocr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_display() {
        let err = ConfigError::out_of_range("detection.confidence_threshold", 1.5, "[0, 1]");
        let msg = err.to_string();
        assert!(msg.contains("detection.confidence_threshold"));
        assert!(msg.contains("1.5"));
    }

    #[test]
    fn test_collaborator_categories() {
        assert_eq!(CollaboratorError::Camera("x".into()).category(), ErrorCategory::Camera);
        assert_eq!(CollaboratorError::Model("x".into()).category(), ErrorCategory::Model);
        assert_eq!(CollaboratorError::Speech("x".into()).category(), ErrorCategory::Tts);
        assert_eq!(CollaboratorError::Ocr("x".into()).category(), ErrorCategory::Ocr);
    }
}
