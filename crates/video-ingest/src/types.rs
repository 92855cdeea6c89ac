use std::path::PathBuf;

use anyhow::Error;
use thiserror::Error;

/// Raw frame captured from a camera device or video file.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Bytes per pixel for the frame's format.
    pub fn channels(&self) -> usize {
        self.format.channels()
    }

    /// A frame is usable only when its buffer matches its declared geometry.
    pub fn is_complete(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == self.width as usize * self.height as usize * self.channels()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn channels(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

/// Requested capture geometry and rate. Devices apply these best-effort.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptureSettings {
    pub width: i32,
    pub height: i32,
    pub fps: f64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30.0,
        }
    }
}

/// Properties a device may be asked to change after opening.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraProperty {
    FrameWidth,
    FrameHeight,
    Fps,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no camera available (tried device indices {tried:?})")]
    NoCameraAvailable { tried: Vec<i32> },
    #[error("failed to open camera device #{index}")]
    Open { index: i32 },
    #[error("failed to open video file {path}: {reason}")]
    OpenFile { path: PathBuf, reason: String },
    #[error("camera is not open")]
    NotOpen,
    #[error("camera returned an empty frame")]
    EmptyFrame,
    #[error("camera read failed: {0}")]
    Read(String),
    #[error("failed to write video frame: {0}")]
    Write(String),
    #[error(transparent)]
    Other(#[from] Error),
}

impl CaptureError {
    /// Read-side failures are transient on a live camera and mark the end of
    /// the stream on a video file. Anything else concerns the device itself.
    pub fn is_read_error(&self) -> bool {
        matches!(
            self,
            CaptureError::NotOpen | CaptureError::EmptyFrame | CaptureError::Read(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: i32, height: i32, len: usize) -> Frame {
        Frame {
            data: vec![0; len],
            width,
            height,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        }
    }

    #[test]
    fn complete_frame_matches_geometry() {
        assert!(frame(4, 2, 24).is_complete());
        assert!(!frame(4, 2, 23).is_complete());
        assert!(!frame(0, 2, 0).is_complete());
    }

    #[test]
    fn read_errors_are_classified() {
        assert!(CaptureError::EmptyFrame.is_read_error());
        assert!(CaptureError::NotOpen.is_read_error());
        assert!(!CaptureError::NoCameraAvailable { tried: vec![0] }.is_read_error());
        assert!(!CaptureError::Write("disk full".into()).is_read_error());
    }
}
