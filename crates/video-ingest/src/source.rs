//! Camera lifecycle: index search on open, validated reads, and release.

use std::{path::Path, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    device::{CameraBackend, CameraDevice},
    types::{CameraProperty, CaptureError, CaptureSettings, Frame},
};

/// Device indices tried when no explicit camera is configured.
pub const DEFAULT_DEVICE_INDICES: [i32; 3] = [0, 1, 2];

/// Owns at most one open camera handle at a time.
///
/// Opening always releases the previous handle first, and the handle is
/// released on drop, so a source never leaks a device.
pub struct FrameSource {
    backend: Arc<dyn CameraBackend>,
    indices: Vec<i32>,
    settings: CaptureSettings,
    device: Option<Box<dyn CameraDevice>>,
    active_index: Option<i32>,
}

impl FrameSource {
    pub fn new(
        backend: Arc<dyn CameraBackend>,
        indices: Vec<i32>,
        settings: CaptureSettings,
    ) -> Self {
        Self {
            backend,
            indices,
            settings,
            device: None,
            active_index: None,
        }
    }

    /// Try each configured index in order and keep the first that opens.
    ///
    /// Returns the index in use. Property configuration is best-effort.
    pub fn open(&mut self) -> Result<i32, CaptureError> {
        self.release();

        for &index in &self.indices {
            debug!(index, backend = self.backend.name(), "attempting to open camera");
            match self.backend.open_device(index) {
                Ok(mut device) => {
                    configure_device(device.as_mut(), &self.settings, index);
                    info!(index, backend = self.backend.name(), "camera opened");
                    self.device = Some(device);
                    self.active_index = Some(index);
                    return Ok(index);
                }
                Err(err) => {
                    debug!(index, "camera open failed: {err}");
                }
            }
        }

        Err(CaptureError::NoCameraAvailable {
            tried: self.indices.clone(),
        })
    }

    /// Open a video file instead of a device. Frames are read until the first
    /// failed read, which marks the end of the file.
    pub fn open_file(&mut self, path: &Path) -> Result<(), CaptureError> {
        self.release();
        let device = self.backend.open_file(path)?;
        info!(path = %path.display(), backend = self.backend.name(), "video file opened");
        self.device = Some(device);
        Ok(())
    }

    /// Read one frame. Empty or malformed buffers are reported as errors.
    pub fn read(&mut self) -> Result<Frame, CaptureError> {
        let device = self.device.as_mut().ok_or(CaptureError::NotOpen)?;
        let frame = device.read()?;
        if !frame.is_complete() {
            return Err(CaptureError::EmptyFrame);
        }
        Ok(frame)
    }

    /// Release the current handle if one is held. Idempotent.
    pub fn release(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.release();
            match self.active_index.take() {
                Some(index) => info!(index, "camera released"),
                None => debug!("video file released"),
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn active_index(&self) -> Option<i32> {
        self.active_index
    }

    /// Frame rate reported by the open device, else the requested rate.
    pub fn fps(&self) -> f64 {
        self.device
            .as_ref()
            .and_then(|device| device.property(CameraProperty::Fps))
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .unwrap_or(self.settings.fps)
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn configure_device(device: &mut dyn CameraDevice, settings: &CaptureSettings, index: i32) {
    let requests = [
        (CameraProperty::FrameWidth, settings.width as f64),
        (CameraProperty::FrameHeight, settings.height as f64),
        (CameraProperty::Fps, settings.fps),
    ];
    for (property, value) in requests {
        if !device.set_property(property, value) {
            warn!(index, ?property, value, "camera rejected property");
        }
    }
}

/// Parse a `/dev/videoX` style identifier or bare integer into a device index.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::types::FrameFormat;

    #[derive(Default)]
    struct Calls {
        opens: Mutex<Vec<i32>>,
        releases: AtomicUsize,
        rejected_properties: AtomicUsize,
    }

    struct FakeDevice {
        calls: Arc<Calls>,
        frame_len: usize,
        accept_properties: bool,
    }

    impl CameraDevice for FakeDevice {
        fn read(&mut self) -> Result<Frame, CaptureError> {
            Ok(Frame {
                data: vec![0; self.frame_len],
                width: 2,
                height: 2,
                timestamp_ms: 1,
                format: FrameFormat::Bgr8,
            })
        }

        fn set_property(&mut self, _property: CameraProperty, _value: f64) -> bool {
            if !self.accept_properties {
                self.calls.rejected_properties.fetch_add(1, Ordering::SeqCst);
            }
            self.accept_properties
        }

        fn release(&mut self) {
            self.calls.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeBackend {
        calls: Arc<Calls>,
        working: Vec<i32>,
        frame_len: usize,
        accept_properties: bool,
    }

    impl CameraBackend for FakeBackend {
        fn open_device(&self, index: i32) -> Result<Box<dyn CameraDevice>, CaptureError> {
            self.calls.opens.lock().unwrap().push(index);
            if self.working.contains(&index) {
                Ok(Box::new(FakeDevice {
                    calls: self.calls.clone(),
                    frame_len: self.frame_len,
                    accept_properties: self.accept_properties,
                }))
            } else {
                Err(CaptureError::Open { index })
            }
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn source(working: Vec<i32>, frame_len: usize) -> (FrameSource, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let backend = FakeBackend {
            calls: calls.clone(),
            working,
            frame_len,
            accept_properties: true,
        };
        let source = FrameSource::new(
            Arc::new(backend),
            DEFAULT_DEVICE_INDICES.to_vec(),
            CaptureSettings::default(),
        );
        (source, calls)
    }

    #[test]
    fn open_uses_first_working_index() {
        let (mut source, calls) = source(vec![1, 2], 12);
        assert_eq!(source.open().unwrap(), 1);
        assert_eq!(*calls.opens.lock().unwrap(), vec![0, 1]);
        assert_eq!(source.active_index(), Some(1));
    }

    #[test]
    fn open_fails_when_every_index_fails() {
        let (mut source, calls) = source(vec![], 12);
        match source.open() {
            Err(CaptureError::NoCameraAvailable { tried }) => assert_eq!(tried, vec![0, 1, 2]),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert_eq!(*calls.opens.lock().unwrap(), vec![0, 1, 2]);
        assert!(!source.is_open());
    }

    #[test]
    fn rejected_properties_do_not_fail_open() {
        let calls = Arc::new(Calls::default());
        let backend = FakeBackend {
            calls: calls.clone(),
            working: vec![0],
            frame_len: 12,
            accept_properties: false,
        };
        let mut source = FrameSource::new(Arc::new(backend), vec![0], CaptureSettings::default());
        assert_eq!(source.open().unwrap(), 0);
        assert_eq!(calls.rejected_properties.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn reopen_releases_previous_handle() {
        let (mut source, calls) = source(vec![0], 12);
        source.open().unwrap();
        source.open().unwrap();
        assert_eq!(calls.releases.load(Ordering::SeqCst), 1);
        drop(source);
        assert_eq!(calls.releases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn release_is_idempotent() {
        let (mut source, calls) = source(vec![0], 12);
        source.open().unwrap();
        source.release();
        source.release();
        drop(source);
        assert_eq!(calls.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn read_rejects_short_buffers_and_closed_source() {
        let (mut source, _calls) = source(vec![0], 5);
        assert!(matches!(source.read(), Err(CaptureError::NotOpen)));
        source.open().unwrap();
        assert!(matches!(source.read(), Err(CaptureError::EmptyFrame)));
    }

    #[test]
    fn video_files_need_backend_support() {
        let (mut source, calls) = source(vec![0], 12);
        source.open().unwrap();
        match source.open_file(Path::new("clip.mp4")) {
            Err(CaptureError::OpenFile { path, reason }) => {
                assert_eq!(path, Path::new("clip.mp4"));
                assert!(reason.contains("fake"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(!source.is_open());
        assert_eq!(source.active_index(), None);
        assert_eq!(calls.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fps_falls_back_to_requested_rate() {
        let (mut source, _calls) = source(vec![0], 12);
        source.open().unwrap();
        assert_eq!(source.fps(), CaptureSettings::default().fps);
    }

    #[test]
    fn parses_device_identifiers() {
        assert_eq!(parse_device_index("2"), Some(2));
        assert_eq!(parse_device_index("/dev/video4"), Some(4));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://cam"), None);
    }
}
