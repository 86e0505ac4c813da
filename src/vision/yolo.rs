//! YOLOv8 object detector via ONNX Runtime

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use ndarray::{Array4, ArrayView2};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::PathBuf;
use tracing::{debug, info};

use super::detection::{Detector, DetectorFactory, RawDetection};
use crate::capture::frame::Frame;
use crate::config::DetectionSettings;

/// COCO ids of the classes the loop cares about
const COCO_TARGETS: &[(usize, &str)] = &[(0, "person"), (2, "car"), (56, "chair")];

/// Number of COCO classes in a YOLOv8 head
const COCO_CLASS_COUNT: usize = 80;

/// Loads [`YoloDetector`]s from a model file
#[derive(Debug, Clone)]
pub struct YoloDetectorFactory {
    model_path: PathBuf,
    input_size: u32,
    score_threshold: f32,
    iou_threshold: f32,
}

impl YoloDetectorFactory {
    pub fn new(settings: &DetectionSettings) -> Self {
        Self {
            model_path: settings.model_path.clone(),
            input_size: settings.input_size,
            score_threshold: settings.confidence_threshold,
            iou_threshold: settings.nms_iou_threshold,
        }
    }
}

impl DetectorFactory for YoloDetectorFactory {
    fn load(&self) -> Result<Box<dyn Detector>> {
        if !self.model_path.is_file() {
            bail!("model file {:?} not found", self.model_path);
        }
        Ok(Box::new(YoloDetector::new(self)?))
    }
}

/// ONNX Runtime session running a YOLOv8 export
pub struct YoloDetector {
    session: Session,
    input_name: String,
    output_name: String,
    input_size: u32,
    score_threshold: f32,
    iou_threshold: f32,
}

impl YoloDetector {
    fn new(factory: &YoloDetectorFactory) -> Result<Self> {
        info!("Loading ONNX model from {:?}", factory.model_path);

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&factory.model_path)
            .context("Failed to load ONNX model")?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .context("model has no inputs")?;
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .context("model has no outputs")?;

        info!("Model loaded. Input: {}, Output: {}", input_name, output_name);

        Ok(Self {
            session,
            input_name,
            output_name,
            input_size: factory.input_size,
            score_threshold: factory.score_threshold,
            iou_threshold: factory.iou_threshold,
        })
    }
}

impl Detector for YoloDetector {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        let input = to_input_tensor(frame, self.input_size)?;
        let size = self.input_size as usize;
        let tensor = Tensor::from_array(([1usize, 3, size, size], input))?;

        let outputs = self.session.run(ort::inputs! {
            self.input_name.as_str() => tensor,
        })?;
        let output = outputs
            .get(self.output_name.as_str())
            .with_context(|| format!("missing output {}", self.output_name))?;

        let (shape, data) = output.try_extract_tensor::<f32>()?;
        if shape.len() != 3 || shape[1] < 4 {
            bail!("unexpected YOLO output shape {:?}", shape.to_vec());
        }
        let rows = shape[1] as usize;
        let candidates = shape[2] as usize;
        let view = ArrayView2::from_shape((rows, candidates), data).context("YOLO output has the wrong length")?;

        let detections = decode(
            view,
            frame.width as f32 / self.input_size as f32,
            frame.height as f32 / self.input_size as f32,
            self.score_threshold,
            self.iou_threshold,
        );
        debug!("YOLO produced {} candidate detections", detections.len());
        Ok(detections)
    }
}

/// Resize to the model input and lay out as normalized CHW floats
fn to_input_tensor(frame: &Frame, input_size: u32) -> Result<Vec<f32>> {
    let image = frame.to_rgb_image().context("frame buffer does not match its dimensions")?;
    let resized = image::imageops::resize(&image, input_size, input_size, FilterType::Triangle);

    let size = input_size as usize;
    let mut input = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }

    let (data, _) = input.into_raw_vec_and_offset();
    Ok(data)
}

/// Decode a `[4 + classes, candidates]` YOLOv8 head into frame-space boxes
fn decode(output: ArrayView2<f32>, scale_x: f32, scale_y: f32, score_threshold: f32, iou_threshold: f32) -> Vec<RawDetection> {
    let classes = output.nrows().saturating_sub(4).min(COCO_CLASS_COUNT);
    let mut candidates = Vec::new();

    for i in 0..output.ncols() {
        let mut best_class = 0;
        let mut best_score = f32::MIN;
        for class in 0..classes {
            let score = output[[4 + class, i]];
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }

        if best_score < score_threshold {
            continue;
        }
        let Some(&(_, label)) = COCO_TARGETS.iter().find(|(id, _)| *id == best_class) else {
            continue;
        };

        let (cx, cy, w, h) = (output[[0, i]], output[[1, i]], output[[2, i]], output[[3, i]]);
        if !(cx.is_finite() && cy.is_finite() && w.is_finite() && h.is_finite()) {
            continue;
        }

        candidates.push(RawDetection {
            label: label.to_string(),
            confidence: best_score,
            bbox: [
                (cx - w / 2.0) * scale_x,
                (cy - h / 2.0) * scale_y,
                (cx + w / 2.0) * scale_x,
                (cy + h / 2.0) * scale_y,
            ],
        });
    }

    non_maximum_suppression(candidates, iou_threshold)
}

/// Per-class greedy NMS, highest confidence first
fn non_maximum_suppression(mut candidates: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<RawDetection> = Vec::new();
    for candidate in candidates {
        let suppressed = kept
            .iter()
            .any(|k| k.label == candidate.label && iou(&k.bbox, &candidate.bbox) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let intersection = ix * iy;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}
