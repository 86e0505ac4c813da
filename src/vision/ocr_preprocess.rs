//! Image preprocessing for OCR
//!
//! Turns a camera frame into a clean binary image: grayscale, light
//! Gaussian blur, local-mean adaptive threshold, then a small morphological
//! close to join broken strokes.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::filter::{box_filter, gaussian_blur_f32};
use imageproc::morphology::close;
use tracing::debug;

use crate::capture::frame::Frame;

/// Filter parameters
#[derive(Debug, Clone)]
pub struct OcrPreprocessing {
    /// Gaussian blur sigma (0 disables the blur)
    pub blur_sigma: f32,
    /// Radius of the neighbourhood the threshold is computed over
    pub block_radius: u32,
    /// Subtracted from the local mean before comparing
    pub offset: u8,
    /// Radius of the closing step (0 disables it)
    pub close_radius: u8,
}

impl Default for OcrPreprocessing {
    fn default() -> Self {
        Self {
            blur_sigma: 0.8,
            block_radius: 5,
            offset: 2,
            close_radius: 1,
        }
    }
}

/// Binary image ready for the OCR engine, `None` for a malformed frame
pub fn prepare(frame: &Frame, settings: &OcrPreprocessing) -> Option<GrayImage> {
    let rgb = frame.to_rgb_image()?;
    let gray = image::imageops::grayscale(&rgb);

    let blurred = if settings.blur_sigma > 0.0 {
        gaussian_blur_f32(&gray, settings.blur_sigma)
    } else {
        gray
    };

    let mut binary = adaptive_threshold(&blurred, settings.block_radius, settings.offset);
    if settings.close_radius > 0 {
        binary = close(&binary, Norm::LInf, settings.close_radius);
    }

    debug!("Preprocessed {}x{} frame for OCR", frame.width, frame.height);
    Some(binary)
}

/// White where a pixel is brighter than its neighbourhood mean minus `offset`
fn adaptive_threshold(image: &GrayImage, block_radius: u32, offset: u8) -> GrayImage {
    let means = box_filter(image, block_radius, block_radius);
    let mut out = GrayImage::new(image.width(), image.height());
    for (x, y, pixel) in image.enumerate_pixels() {
        let mean = means.get_pixel(x, y)[0];
        let value = if pixel[0] as i16 > mean as i16 - offset as i16 { 255 } else { 0 };
        out.put_pixel(x, y, Luma([value]));
    }
    out
}
