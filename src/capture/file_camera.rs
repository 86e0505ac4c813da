//! File-backed cameras
//!
//! Camera index `i` maps to `camera.sources[i]`. A file source is decoded
//! again on every read, so an external capture tool can keep overwriting
//! it. A directory source replays its images in name order and loops.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::frame::Frame;
use super::{CameraDevice, CameraFactory};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// Opens file and directory frame sources by index
#[derive(Debug, Clone, Default)]
pub struct FileCameraFactory {
    sources: Vec<PathBuf>,
}

impl FileCameraFactory {
    pub fn new(sources: Vec<PathBuf>) -> Self {
        Self { sources }
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }
}

impl CameraFactory for FileCameraFactory {
    fn open(&self, index: usize) -> Result<Box<dyn CameraDevice>> {
        let Some(path) = self.sources.get(index) else {
            bail!("no frame source configured for camera index {}", index);
        };

        let mode = if path.is_dir() {
            let frames = list_images(path)?;
            if frames.is_empty() {
                bail!("frame directory {:?} contains no images", path);
            }
            info!("Camera {} replays {} frames from {:?}", index, frames.len(), path);
            SourceMode::Sequence { frames, position: 0 }
        } else if path.is_file() {
            info!("Camera {} reads snapshots from {:?}", index, path);
            SourceMode::Snapshot(path.clone())
        } else {
            bail!("frame source {:?} does not exist", path);
        };

        Ok(Box::new(FileCamera {
            mode,
            sequence: 0,
            open: true,
        }))
    }
}

enum SourceMode {
    Snapshot(PathBuf),
    Sequence { frames: Vec<PathBuf>, position: usize },
}

/// An open file-backed camera
pub struct FileCamera {
    mode: SourceMode,
    sequence: u64,
    open: bool,
}

impl CameraDevice for FileCamera {
    fn read(&mut self) -> Result<Option<Frame>> {
        if !self.open {
            bail!("camera is closed");
        }

        let path = match &mut self.mode {
            SourceMode::Snapshot(path) => {
                if !path.exists() {
                    debug!("Snapshot {:?} not present yet", path);
                    return Ok(None);
                }
                path.clone()
            }
            SourceMode::Sequence { frames, position } => {
                let path = frames[*position % frames.len()].clone();
                *position = (*position + 1) % frames.len();
                path
            }
        };

        let image = image::open(&path)
            .with_context(|| format!("Failed to decode frame {:?}", path))?
            .to_rgb8();

        let frame = Frame::from_image(image, self.sequence);
        self.sequence += 1;
        Ok(Some(frame))
    }

    fn close(&mut self) {
        self.open = false;
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list frame directory {:?}", dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    frames.sort();
    Ok(frames)
}
