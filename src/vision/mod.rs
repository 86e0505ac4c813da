//! Vision Layer
//!
//! Object detection and text reading on captured frames:
//! - Detection adapter over a YOLOv8 ONNX model
//! - Tesseract OCR with preprocessing
//! - Asynchronous OCR request pipeline

pub mod detection;
pub mod ocr;
pub mod ocr_pipeline;
pub mod ocr_preprocess;
pub mod tesseract;
pub mod yolo;

pub use detection::{Detection, Detector, DetectorFactory, ObjectDetector};
pub use ocr::{Extraction, TextExtractor, TextValidator};
pub use ocr_pipeline::{OcrPhase, OcrPipeline};
pub use tesseract::TesseractEngine;
pub use yolo::YoloDetectorFactory;
