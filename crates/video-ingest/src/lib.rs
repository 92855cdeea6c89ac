//! Camera capture for the detection pipeline.
//!
//! [`FrameSource`] owns the device lifecycle on top of a pluggable
//! [`CameraBackend`]. The OpenCV backend, which also reads and writes video
//! files, is available behind the `opencv` feature.

#[cfg(feature = "opencv")]
mod camera;
mod device;
mod source;
mod types;

#[cfg(feature = "opencv")]
pub use camera::{OpenCvBackend, OpenCvVideoWriter};
pub use device::{CameraBackend, CameraDevice, FrameSink};
pub use source::{DEFAULT_DEVICE_INDICES, FrameSource, parse_device_index};
pub use types::{CameraProperty, CaptureError, CaptureSettings, Frame, FrameFormat};
