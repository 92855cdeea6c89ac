//! OpenCV-backed camera devices, video file input, and video file output.

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use chrono::Utc;
use opencv::{
    core::{Mat, Size},
    prelude::*,
    videoio::{self, VideoCapture, VideoWriter},
};
use tracing::{debug, info, warn};

use crate::{
    device::{CameraBackend, CameraDevice, FrameSink},
    types::{CameraProperty, CaptureError, Frame, FrameFormat},
};

/// Opens local capture devices and video files through OpenCV's `videoio`.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenCvBackend;

impl CameraBackend for OpenCvBackend {
    fn open_device(&self, index: i32) -> Result<Box<dyn CameraDevice>, CaptureError> {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    let opened = cap
                        .is_opened()
                        .map_err(|e| CaptureError::Other(e.into()))?;
                    if opened {
                        return Ok(Box::new(OpenCvDevice {
                            cap,
                            frame: Mat::default(),
                        }));
                    }
                }
                Err(err) => {
                    debug!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
        Err(CaptureError::Open { index })
    }

    fn open_file(&self, path: &Path) -> Result<Box<dyn CameraDevice>, CaptureError> {
        let open_err = |reason: String| CaptureError::OpenFile {
            path: path.to_path_buf(),
            reason,
        };
        let name = path
            .to_str()
            .ok_or_else(|| open_err("path is not valid UTF-8".into()))?;
        let cap = VideoCapture::from_file(name, videoio::CAP_ANY)
            .map_err(|e| open_err(e.to_string()))?;
        if !cap.is_opened().map_err(|e| open_err(e.to_string()))? {
            return Err(open_err("no decoder could open the file".into()));
        }
        Ok(Box::new(OpenCvDevice {
            cap,
            frame: Mat::default(),
        }))
    }

    fn name(&self) -> &'static str {
        "opencv"
    }
}

fn property_id(property: CameraProperty) -> i32 {
    match property {
        CameraProperty::FrameWidth => videoio::CAP_PROP_FRAME_WIDTH,
        CameraProperty::FrameHeight => videoio::CAP_PROP_FRAME_HEIGHT,
        CameraProperty::Fps => videoio::CAP_PROP_FPS,
    }
}

struct OpenCvDevice {
    cap: VideoCapture,
    frame: Mat,
}

impl CameraDevice for OpenCvDevice {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        let grabbed = self
            .cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Read(e.to_string()))?;
        if !grabbed || self.frame.empty() {
            return Err(CaptureError::EmptyFrame);
        }

        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 || size.height <= 0 {
            return Err(CaptureError::EmptyFrame);
        }
        if self.frame.channels() != 3 {
            return Err(CaptureError::Other(anyhow!(
                "unsupported channel count {}",
                self.frame.channels()
            )));
        }

        let data = if self.frame.is_continuous() {
            self.frame
                .data_bytes()
                .map_err(|e| CaptureError::Other(e.into()))?
                .to_vec()
        } else {
            let packed = self
                .frame
                .try_clone()
                .map_err(|e| CaptureError::Other(e.into()))?;
            packed
                .data_bytes()
                .map_err(|e| CaptureError::Other(e.into()))?
                .to_vec()
        };

        Ok(Frame {
            data,
            width: size.width,
            height: size.height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }

    fn set_property(&mut self, property: CameraProperty, value: f64) -> bool {
        matches!(self.cap.set(property_id(property), value), Ok(true))
    }

    fn property(&self, property: CameraProperty) -> Option<f64> {
        self.cap.get(property_id(property)).ok()
    }

    fn release(&mut self) {
        if let Err(err) = self.cap.release() {
            warn!("camera release reported an error: {err}");
        }
    }
}

/// Writes BGR frames to an `mp4v` video file. The file is created on the
/// first frame, which fixes the output size.
pub struct OpenCvVideoWriter {
    path: PathBuf,
    fps: f64,
    open: Option<(VideoWriter, Size)>,
}

impl OpenCvVideoWriter {
    pub fn new(path: impl Into<PathBuf>, fps: f64) -> Self {
        Self {
            path: path.into(),
            fps,
            open: None,
        }
    }

    fn create(&self, size: Size) -> Result<VideoWriter, CaptureError> {
        let open_err = |reason: String| CaptureError::OpenFile {
            path: self.path.clone(),
            reason,
        };
        let name = self
            .path
            .to_str()
            .ok_or_else(|| open_err("path is not valid UTF-8".into()))?;
        let fourcc =
            VideoWriter::fourcc('m', 'p', '4', 'v').map_err(|e| open_err(e.to_string()))?;
        let writer = VideoWriter::new(name, fourcc, self.fps, size, true)
            .map_err(|e| open_err(e.to_string()))?;
        if !writer.is_opened().map_err(|e| open_err(e.to_string()))? {
            return Err(open_err("no encoder could open the file".into()));
        }
        info!(
            path = %self.path.display(),
            width = size.width,
            height = size.height,
            fps = self.fps,
            "video writer opened"
        );
        Ok(writer)
    }
}

impl FrameSink for OpenCvVideoWriter {
    fn write(&mut self, frame: &Frame) -> Result<(), CaptureError> {
        let size = Size::new(frame.width, frame.height);
        if self.open.is_none() {
            let writer = self.create(size)?;
            self.open = Some((writer, size));
        }
        let Some((writer, expected)) = self.open.as_mut() else {
            return Err(CaptureError::NotOpen);
        };
        if *expected != size {
            return Err(CaptureError::Write(format!(
                "frame is {}x{}, writer expects {}x{}",
                size.width, size.height, expected.width, expected.height
            )));
        }
        let flat = Mat::from_slice(&frame.data).map_err(|e| CaptureError::Write(e.to_string()))?;
        let bgr = flat
            .reshape(3, frame.height)
            .map_err(|e| CaptureError::Write(e.to_string()))?;
        writer
            .write(&bgr)
            .map_err(|e| CaptureError::Write(e.to_string()))
    }

    fn finish(&mut self) {
        if let Some((mut writer, _)) = self.open.take() {
            if let Err(err) = writer.release() {
                warn!("video writer release reported an error: {err}");
            }
        }
    }
}
