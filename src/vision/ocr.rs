//! Text extraction boundary and OCR output validation

use anyhow::Result;

use crate::capture::frame::Frame;
use crate::config::OcrSettings;

/// Spoken when extraction produced nothing worth reading aloud
pub const NO_TEXT_MESSAGE: &str = "No readable text found. Try better lighting or move closer to the text.";

/// Outcome of one extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// Extracted text, `None` when nothing usable was found
    pub text: Option<String>,
    /// Status line suitable for the user
    pub status: String,
}

impl Extraction {
    pub fn found(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            status: "Text extracted successfully".to_string(),
        }
    }

    pub fn empty(status: impl Into<String>) -> Self {
        Self {
            text: None,
            status: status.into(),
        }
    }
}

/// Black-box image to text engine
pub trait TextExtractor: Send + Sync {
    fn extract(&self, frame: &Frame) -> Result<Extraction>;
}

/// Rejects OCR noise before it is read aloud
#[derive(Debug, Clone)]
pub struct TextValidator {
    pub min_length: usize,
    pub min_printable_ratio: f32,
    pub min_alphanumeric_ratio: f32,
}

impl Default for TextValidator {
    fn default() -> Self {
        Self::from(&OcrSettings::default())
    }
}

impl From<&OcrSettings> for TextValidator {
    fn from(settings: &OcrSettings) -> Self {
        Self {
            min_length: settings.min_text_length,
            min_printable_ratio: settings.min_printable_ratio,
            min_alphanumeric_ratio: settings.min_alphanumeric_ratio,
        }
    }
}

impl TextValidator {
    /// Trim and flatten line breaks into spaces
    pub fn clean(text: &str) -> String {
        text.trim().replace('\n', " ").replace('\r', "")
    }

    pub fn is_valid(&self, text: &str) -> bool {
        let cleaned = Self::clean(text);
        let total = cleaned.chars().count();
        if total == 0 || total < self.min_length {
            return false;
        }

        let printable = cleaned.chars().filter(|c| !c.is_control()).count();
        if (printable as f32 / total as f32) < self.min_printable_ratio {
            return false;
        }

        let alphanumeric = cleaned.chars().filter(|c| c.is_alphanumeric()).count();
        (alphanumeric as f32 / total as f32) >= self.min_alphanumeric_ratio
    }

    /// Cleaned text when valid
    pub fn accept(&self, text: &str) -> Option<String> {
        self.is_valid(text).then(|| Self::clean(text))
    }
}
