//! Seams between the frame source and concrete capture drivers.

use std::path::Path;

use crate::types::{CameraProperty, CaptureError, Frame};

/// An opened camera or video handle. Owned by exactly one [`crate::FrameSource`].
pub trait CameraDevice: Send {
    /// Block until the next frame is available.
    fn read(&mut self) -> Result<Frame, CaptureError>;

    /// Request a property change. Returns whether the driver accepted it.
    fn set_property(&mut self, property: CameraProperty, value: f64) -> bool;

    /// Current value of a property, when the driver reports one.
    fn property(&self, _property: CameraProperty) -> Option<f64> {
        None
    }

    /// Give the device back to the OS. Called at most once per handle.
    fn release(&mut self);
}

/// Opens camera devices by index, and video files where supported.
pub trait CameraBackend: Send + Sync {
    fn open_device(&self, index: i32) -> Result<Box<dyn CameraDevice>, CaptureError>;

    fn open_file(&self, path: &Path) -> Result<Box<dyn CameraDevice>, CaptureError> {
        Err(CaptureError::OpenFile {
            path: path.to_path_buf(),
            reason: format!("the {} backend cannot read video files", self.name()),
        })
    }

    /// Short identifier used in logs.
    fn name(&self) -> &'static str;
}

/// Receives annotated BGR frames, e.g. an encoded video file.
pub trait FrameSink: Send {
    fn write(&mut self, frame: &Frame) -> Result<(), CaptureError>;

    /// Flush and close the output. Called once, after the last frame.
    fn finish(&mut self);
}
