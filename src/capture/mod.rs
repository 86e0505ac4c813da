//! Camera capture layer
//!
//! The camera driver is a black box behind [`CameraDevice`]. [`FrameSource`]
//! owns the open device, never lets a read failure escape, and routes every
//! failure through the recovery subsystem.

pub mod file_camera;
pub mod frame;

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::CollaboratorError;
use crate::recovery::{ErrorCategory, ErrorHandler, RecoveryContext};
use frame::Frame;

pub use file_camera::FileCameraFactory;

/// An opened camera
pub trait CameraDevice: Send {
    /// Read the next frame. `Ok(None)` means the device is open but had nothing to deliver.
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Release the device
    fn close(&mut self);
}

/// Opens cameras by index
pub trait CameraFactory: Send + Sync {
    fn open(&self, index: usize) -> Result<Box<dyn CameraDevice>>;
}

/// Frame producer used by the main loop
pub struct FrameSource {
    factory: Arc<dyn CameraFactory>,
    device: Option<Box<dyn CameraDevice>>,
    index: usize,
    errors: Arc<ErrorHandler>,
}

impl FrameSource {
    pub fn new(factory: Arc<dyn CameraFactory>, errors: Arc<ErrorHandler>) -> Self {
        Self {
            factory,
            device: None,
            index: 0,
            errors,
        }
    }

    /// Index of the camera currently (or last) in use
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Open the camera at `index` and confirm it delivers a frame.
    ///
    /// On failure the camera recovery strategy runs once and the index it
    /// found is tried before giving up.
    pub fn initialize(&mut self, index: usize) -> bool {
        self.release();
        self.index = index;

        match self.open_tested(index) {
            Ok(device) => {
                info!("Camera initialized successfully on index {}", index);
                self.device = Some(device);
                self.errors.record_success(ErrorCategory::Camera);
                true
            }
            Err(e) => {
                let mut context = RecoveryContext::new()
                    .with_camera_index(index)
                    .with_detail("camera initialization");
                if !self.errors.handle_error(ErrorCategory::Camera, &format!("{e:#}"), &mut context) {
                    return false;
                }
                let Some(recovered) = context.recovered_camera_index else {
                    return false;
                };
                self.reopen(recovered)
            }
        }
    }

    /// Full reinitialization on the current index
    pub fn reinitialize(&mut self) -> bool {
        info!("Reinitializing camera {}", self.index);
        self.initialize(self.index)
    }

    /// Read one frame.
    ///
    /// Never fails: a read failure is reported to the recovery subsystem, and
    /// after a successful recovery the read is retried exactly once.
    pub fn get_frame(&mut self) -> Option<Frame> {
        let error = match self.read_once() {
            Ok(frame) => {
                self.errors.record_success(ErrorCategory::Camera);
                return Some(frame);
            }
            Err(e) => e,
        };

        warn!("Failed to read frame from camera {}: {:#}", self.index, error);
        let mut context = RecoveryContext::new()
            .with_camera_index(self.index)
            .with_detail("frame read");
        if !self.errors.handle_error(ErrorCategory::Camera, &format!("{error:#}"), &mut context) {
            return None;
        }

        let index = context.recovered_camera_index.unwrap_or(self.index);
        if !self.reopen(index) {
            return None;
        }

        match self.read_once() {
            Ok(frame) => {
                self.errors.record_success(ErrorCategory::Camera);
                Some(frame)
            }
            Err(e) => {
                debug!("Retry read after recovery failed: {:#}", e);
                None
            }
        }
    }

    /// Close the device if one is open
    pub fn release(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.close();
            info!("Camera {} released", self.index);
        }
    }

    fn reopen(&mut self, index: usize) -> bool {
        self.release();
        match self.open_tested(index) {
            Ok(device) => {
                info!("Camera reopened on index {}", index);
                self.device = Some(device);
                self.index = index;
                true
            }
            Err(e) => {
                warn!("Camera {} could not be reopened: {:#}", index, e);
                false
            }
        }
    }

    fn open_tested(&self, index: usize) -> Result<Box<dyn CameraDevice>> {
        let mut device = self.factory.open(index)?;
        match device.read() {
            Ok(Some(frame)) if frame.is_valid() => Ok(device),
            Ok(_) => {
                device.close();
                Err(CollaboratorError::Camera(format!("camera {index} opened but cannot capture frames")).into())
            }
            Err(e) => {
                device.close();
                Err(e)
            }
        }
    }

    fn read_once(&mut self) -> Result<Frame> {
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| CollaboratorError::Camera("camera not initialized".into()))?;

        match device.read()? {
            Some(frame) if frame.is_valid() => Ok(frame),
            Some(frame) => Err(CollaboratorError::Camera(format!(
                "malformed frame {}x{} with {} bytes",
                frame.width,
                frame.height,
                frame.data.len()
            ))
            .into()),
            None => Err(CollaboratorError::Camera("no frame available".into()).into()),
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{RecoveryConfig, RecoveryHooks};
    use crate::testing::SyntheticCameraFactory;

    fn source(factory: Arc<SyntheticCameraFactory>) -> FrameSource {
        let errors = Arc::new(
            ErrorHandler::new(RecoveryConfig::default().without_pauses()).with_hooks(RecoveryHooks {
                cameras: Some(factory.clone()),
                ..Default::default()
            }),
        );
        FrameSource::new(factory, errors)
    }

    #[test]
    fn test_initialize_and_read() {
        let factory = Arc::new(SyntheticCameraFactory::new(vec![0], 10));
        let mut source = source(factory);

        assert!(source.initialize(0));
        let frame = source.get_frame().unwrap();
        assert_eq!(frame.dimensions(), (640, 480));
    }

    #[test]
    fn test_initialize_falls_back_to_recovered_index() {
        let factory = Arc::new(SyntheticCameraFactory::new(vec![2], 10));
        let mut source = source(factory);

        assert!(source.initialize(0));
        assert_eq!(source.index(), 2);
    }

    #[test]
    fn test_initialize_without_any_camera_fails() {
        let factory = Arc::new(SyntheticCameraFactory::new(vec![], 10));
        let mut source = source(factory);

        assert!(!source.initialize(0));
        assert!(!source.is_open());
    }

    #[test]
    fn test_get_frame_never_fails_when_uninitialized() {
        let factory = Arc::new(SyntheticCameraFactory::new(vec![], 10));
        let mut source = source(factory);
        assert!(source.get_frame().is_none());
    }

    #[test]
    fn test_exhausted_device_recovers_by_reopening() {
        // Each opened device yields 3 frames; the open test consumes one.
        let factory = Arc::new(SyntheticCameraFactory::new(vec![0], 3));
        let mut source = source(factory.clone());
        assert!(source.initialize(0));

        assert!(source.get_frame().is_some());
        assert!(source.get_frame().is_some());
        // Device is now exhausted; recovery reopens and the read is retried once.
        assert!(source.get_frame().is_some());
        assert!(factory.opens() >= 3);
    }

    #[test]
    fn test_release_closes_device() {
        let factory = Arc::new(SyntheticCameraFactory::new(vec![0], 10));
        let mut source = source(factory.clone());
        assert!(source.initialize(0));
        source.release();
        assert!(!source.is_open());
        assert_eq!(factory.open_devices(), 0);
    }
}
