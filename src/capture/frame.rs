//! Frame data structures for captured camera content

use image::RgbImage;
use std::time::Instant;

/// A captured camera frame
///
/// Cloning copies the pixel buffer, so a clone never aliases the buffer the
/// camera keeps writing into.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw RGB pixel data, row major
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Position of this frame in its source's stream
    pub sequence: u64,
    /// Timestamp when frame was captured
    pub timestamp: Instant,
}

impl Frame {
    /// Create a new frame
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            data,
            width,
            height,
            sequence,
            timestamp: Instant::now(),
        }
    }

    /// Uniformly filled frame
    pub fn filled(width: u32, height: u32, value: u8, sequence: u64) -> Self {
        Self::new(vec![value; (width * height * 3) as usize], width, height, sequence)
    }

    /// Build a frame from a decoded image
    pub fn from_image(image: RgbImage, sequence: u64) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, sequence)
    }

    /// Get frame dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Frame area in pixels
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// A frame is usable when it has pixels and the buffer matches its dimensions
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() as u64 == self.area() * 3
    }

    /// Copy the pixels into an [`RgbImage`]
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        if !self.is_valid() {
            return None;
        }
        RgbImage::from_raw(self.width, self.height, self.data.clone())
    }
}
