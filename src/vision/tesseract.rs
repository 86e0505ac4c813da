//! Tesseract command-line OCR engine

use anyhow::{bail, Context, Result};
use std::io::ErrorKind;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::ocr::{Extraction, TextExtractor, TextValidator, NO_TEXT_MESSAGE};
use super::ocr_preprocess::{self, OcrPreprocessing};
use crate::capture::frame::Frame;
use crate::config::OcrSettings;
use crate::error::CollaboratorError;

const CHAR_WHITELIST: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz .,!?-";

/// Page segmentation: uniform block of text, then single word on retry
const BLOCK_PSM: &str = "6";
const WORD_PSM: &str = "8";

/// Runs the `tesseract` executable on preprocessed frames
#[derive(Debug, Clone)]
pub struct TesseractEngine {
    command: String,
    timeout: Duration,
    validator: TextValidator,
    preprocessing: OcrPreprocessing,
}

impl TesseractEngine {
    pub fn new(settings: &OcrSettings) -> Self {
        Self {
            command: settings.tesseract_cmd.clone(),
            timeout: Duration::from_secs(settings.timeout_seconds),
            validator: TextValidator::from(settings),
            preprocessing: OcrPreprocessing::default(),
        }
    }

    /// Installed Tesseract version, if the executable can be run
    pub fn version(&self) -> Option<String> {
        let output = Command::new(&self.command).arg("--version").output().ok()?;
        let text = if output.stdout.is_empty() { output.stderr } else { output.stdout };
        String::from_utf8_lossy(&text).lines().next().map(str::to_string)
    }

    fn run(&self, image: &Path, out_base: &Path, psm: &str) -> Result<String> {
        let mut child = match Command::new(&self.command)
            .arg(image)
            .arg(out_base)
            .args(["--oem", "3", "--psm", psm])
            .args(["-c", &format!("tessedit_char_whitelist={CHAR_WHITELIST}")])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CollaboratorError::Ocr(format!("Tesseract OCR not found ({})", self.command)).into())
            }
            Err(e) => return Err(e).context("Failed to start tesseract"),
        };

        let deadline = Instant::now() + self.timeout;
        let status: ExitStatus = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                bail!(CollaboratorError::Ocr(format!("tesseract timed out after {:?}", self.timeout)));
            }
            std::thread::sleep(Duration::from_millis(20));
        };

        if !status.success() {
            bail!(CollaboratorError::Ocr(format!("tesseract exited with {status}")));
        }

        let text_path = out_base.with_extension("txt");
        std::fs::read_to_string(&text_path).with_context(|| format!("Failed to read OCR output {:?}", text_path))
    }
}

impl TextExtractor for TesseractEngine {
    fn extract(&self, frame: &Frame) -> Result<Extraction> {
        let Some(binary) = ocr_preprocess::prepare(frame, &self.preprocessing) else {
            return Ok(Extraction::empty("Invalid image provided"));
        };

        let workdir = tempfile::tempdir().context("Failed to create OCR work directory")?;
        let image_path = workdir.path().join("frame.png");
        binary.save(&image_path).context("Failed to write OCR input")?;
        let out_base = workdir.path().join("out");

        let raw = match self.run(&image_path, &out_base, BLOCK_PSM) {
            Ok(raw) => raw,
            Err(e) if e.downcast_ref::<CollaboratorError>().is_some() && self.version().is_some() => {
                warn!("Tesseract processing error, retrying with simpler layout: {:#}", e);
                self.run(&image_path, &out_base, WORD_PSM)?
            }
            Err(e) => return Err(e),
        };

        match self.validator.accept(&raw) {
            Some(text) => {
                info!("Successfully extracted text: {}", text.chars().take(50).collect::<String>());
                Ok(Extraction::found(text))
            }
            None => {
                debug!("No valid text found in image");
                Ok(Extraction::empty(NO_TEXT_MESSAGE))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(command: &str) -> TesseractEngine {
        let mut settings = OcrSettings::default();
        settings.tesseract_cmd = command.to_string();
        settings.timeout_seconds = 2;
        TesseractEngine::new(&settings)
    }

    #[test]
    fn test_missing_executable_is_an_error() {
        let engine = engine("visionmate-no-such-tesseract");
        let result = engine.extract(&Frame::filled(32, 16, 255, 0));
        let err = result.unwrap_err();
        assert!(err.downcast_ref::<CollaboratorError>().is_some());
        assert!(engine.version().is_none());
    }

    #[test]
    fn test_invalid_frame_short_circuits() {
        let engine = engine("visionmate-no-such-tesseract");
        let result = engine.extract(&Frame::new(vec![], 0, 0, 0)).unwrap();
        assert!(result.text.is_none());
        assert_eq!(result.status, "Invalid image provided");
    }
}
