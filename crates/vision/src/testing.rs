//! Scripted camera and model doubles for exercising the pipeline without
//! hardware or model weights.

use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use chrono::Utc;
use ml_core::{
    DetectionModel, FrameView, ModelError, ModelLoader, ModelSource, RawDetection, Thresholds,
};
use video_ingest::{
    CameraBackend, CameraDevice, CameraProperty, CaptureError, Frame, FrameFormat, FrameSink,
};

use crate::config::PPE_CLASS_NAMES;

/// What the next read from a [`ScriptedCamera`] device returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptedRead {
    Frame,
    Fail,
    Empty,
}

/// Call counts shared by a [`ScriptedCamera`] and every device it opened.
#[derive(Debug, Default)]
pub struct CameraCalls {
    opens: AtomicUsize,
    failed_opens: AtomicUsize,
    reads: AtomicUsize,
    releases: AtomicUsize,
}

impl CameraCalls {
    /// Successful device opens.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn failed_opens(&self) -> usize {
        self.failed_opens.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct CameraScript {
    opens: VecDeque<bool>,
    open_default: bool,
    reads: VecDeque<ScriptedRead>,
    read_default: ScriptedRead,
}

/// Camera backend whose open and read results follow a script. Once a script
/// runs out the configured default repeats.
#[derive(Clone, Debug)]
pub struct ScriptedCamera {
    script: Arc<Mutex<CameraScript>>,
    calls: Arc<CameraCalls>,
    width: i32,
    height: i32,
}

impl ScriptedCamera {
    /// Every open succeeds and every read yields a frame.
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            script: Arc::new(Mutex::new(CameraScript {
                opens: VecDeque::new(),
                open_default: true,
                reads: VecDeque::new(),
                read_default: ScriptedRead::Frame,
            })),
            calls: Arc::new(CameraCalls::default()),
            width,
            height,
        }
    }

    /// A backend with no working device.
    pub fn unavailable() -> Self {
        Self::new(640, 480).with_opens([], false)
    }

    /// Results of successive `open_device` calls, then `default`.
    pub fn with_opens(self, opens: impl IntoIterator<Item = bool>, default: bool) -> Self {
        {
            let mut script = self.lock();
            script.opens = opens.into_iter().collect();
            script.open_default = default;
        }
        self
    }

    /// Results of successive reads, then `default`.
    pub fn with_reads(
        self,
        reads: impl IntoIterator<Item = ScriptedRead>,
        default: ScriptedRead,
    ) -> Self {
        {
            let mut script = self.lock();
            script.reads = reads.into_iter().collect();
            script.read_default = default;
        }
        self
    }

    pub fn calls(&self) -> Arc<CameraCalls> {
        self.calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CameraScript> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ScriptedCamera {
    fn next_open(&self) -> Option<Box<dyn CameraDevice>> {
        let opened = {
            let mut script = self.lock();
            let default = script.open_default;
            script.opens.pop_front().unwrap_or(default)
        };
        if !opened {
            self.calls.failed_opens.fetch_add(1, Ordering::SeqCst);
            return None;
        }
        self.calls.opens.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(ScriptedDevice {
            camera: self.clone(),
            sequence: 0,
        }))
    }
}

/// Files follow the same open and read script as devices.
impl CameraBackend for ScriptedCamera {
    fn open_device(&self, index: i32) -> Result<Box<dyn CameraDevice>, CaptureError> {
        self.next_open().ok_or(CaptureError::Open { index })
    }

    fn open_file(&self, path: &Path) -> Result<Box<dyn CameraDevice>, CaptureError> {
        self.next_open().ok_or_else(|| CaptureError::OpenFile {
            path: path.to_path_buf(),
            reason: "scripted open failure".into(),
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

struct ScriptedDevice {
    camera: ScriptedCamera,
    sequence: u8,
}

impl CameraDevice for ScriptedDevice {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        self.camera.calls.reads.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut script = self.camera.lock();
            let default = script.read_default;
            script.reads.pop_front().unwrap_or(default)
        };
        match next {
            ScriptedRead::Frame => {
                self.sequence = self.sequence.wrapping_add(1);
                let (width, height) = (self.camera.width, self.camera.height);
                Ok(Frame {
                    data: vec![self.sequence; width as usize * height as usize * 3],
                    width,
                    height,
                    timestamp_ms: Utc::now().timestamp_millis(),
                    format: FrameFormat::Bgr8,
                })
            }
            ScriptedRead::Fail => Err(CaptureError::Read("scripted read failure".into())),
            ScriptedRead::Empty => Err(CaptureError::EmptyFrame),
        }
    }

    fn set_property(&mut self, _property: CameraProperty, _value: f64) -> bool {
        true
    }

    fn release(&mut self) {
        self.camera.calls.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Keeps every frame written to it.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub frames: Vec<Frame>,
    pub finished: bool,
}

impl FrameSink for RecordingSink {
    fn write(&mut self, frame: &Frame) -> Result<(), CaptureError> {
        if self.finished {
            return Err(CaptureError::Write("sink already finished".into()));
        }
        self.frames.push(frame.clone());
        Ok(())
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

/// What a [`StaticModel`] does on its next inference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InferStep {
    Detect,
    Fail,
    Panic,
}

/// Returns the same detections for every frame, unless a scripted step says
/// otherwise.
#[derive(Clone, Debug)]
pub struct StaticModel {
    names: Vec<String>,
    detections: Vec<RawDetection>,
    steps: VecDeque<InferStep>,
}

impl StaticModel {
    pub fn new(names: &[&str], detections: Vec<RawDetection>) -> Self {
        Self {
            names: names.iter().map(|name| name.to_string()).collect(),
            detections,
            steps: VecDeque::new(),
        }
    }

    /// One helmet and one missing-vest violation on every frame.
    pub fn ppe() -> Self {
        Self::new(
            &PPE_CLASS_NAMES,
            vec![
                RawDetection {
                    class_id: 0,
                    score: 0.91,
                    bbox: [10.0, 10.0, 60.0, 50.0],
                },
                RawDetection {
                    class_id: 4,
                    score: 0.72,
                    bbox: [20.0, 40.0, 90.0, 110.0],
                },
            ],
        )
    }

    /// Behaviour of the first inferences; afterwards the model detects.
    pub fn with_steps(mut self, steps: impl IntoIterator<Item = InferStep>) -> Self {
        self.steps = steps.into_iter().collect();
        self
    }
}

impl DetectionModel for StaticModel {
    fn class_names(&self) -> &[String] {
        &self.names
    }

    fn infer(
        &mut self,
        _frame: FrameView<'_>,
        _thresholds: Thresholds,
    ) -> Result<Vec<RawDetection>, ModelError> {
        match self.steps.pop_front().unwrap_or(InferStep::Detect) {
            InferStep::Detect => Ok(self.detections.clone()),
            InferStep::Fail => Err(ModelError::Inference("scripted inference failure".into())),
            InferStep::Panic => panic!("scripted inference panic"),
        }
    }
}

/// Hands out clones of a [`StaticModel`] and counts loads.
#[derive(Debug)]
pub struct StaticModelLoader {
    model: StaticModel,
    loads: AtomicUsize,
}

impl StaticModelLoader {
    pub fn new(model: StaticModel) -> Self {
        Self {
            model,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for StaticModelLoader {
    fn load(&self, _source: &ModelSource) -> Result<Box<dyn DetectionModel>, ModelError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.model.clone()))
    }
}

/// Always fails to load.
#[derive(Debug, Default)]
pub struct FailingModelLoader;

impl ModelLoader for FailingModelLoader {
    fn load(&self, source: &ModelSource) -> Result<Box<dyn DetectionModel>, ModelError> {
        Err(ModelError::Load {
            path: source.path.clone(),
            reason: "no such model".into(),
        })
    }
}
