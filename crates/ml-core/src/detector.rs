use chrono::Utc;
use tracing::debug;

use crate::{
    detection::{BoundingBox, DetectionRecord, FrameResult},
    model::{DetectionModel, FrameView, ModelError, ModelLoader, ModelSource, Thresholds},
};

/// Wraps a loaded model and turns its raw output into [`DetectionRecord`]s.
pub struct Detector {
    model: Box<dyn DetectionModel>,
    labels: Vec<String>,
}

impl Detector {
    /// `labels` overrides the class names shipped with the model when given.
    pub fn new(model: Box<dyn DetectionModel>, labels: Option<Vec<String>>) -> Self {
        let labels = labels.unwrap_or_else(|| model.class_names().to_vec());
        Self { model, labels }
    }

    pub fn load(
        loader: &dyn ModelLoader,
        source: &ModelSource,
        labels: Option<Vec<String>>,
    ) -> Result<Self, ModelError> {
        let model = loader.load(source)?;
        let detector = Self::new(model, labels);
        debug!(
            path = %source.path.display(),
            classes = detector.labels.len(),
            "detector ready"
        );
        Ok(detector)
    }

    /// Resolve a class id to its label, falling back to `class_<id>`.
    pub fn label_for(&self, class_id: usize) -> String {
        self.labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Run the model on one frame. The frame is only read.
    pub fn detect(
        &mut self,
        frame: FrameView<'_>,
        frame_number: u64,
        thresholds: Thresholds,
    ) -> Result<FrameResult, ModelError> {
        if frame.width == 0 || frame.height == 0 {
            return Err(ModelError::InvalidInput("frame has no pixels".into()));
        }
        if frame.bgr.len() != frame.expected_len() {
            return Err(ModelError::InvalidInput(format!(
                "unexpected frame buffer size: got {} bytes, expected {}",
                frame.bgr.len(),
                frame.expected_len()
            )));
        }

        let raw = self.model.infer(frame, thresholds)?;
        let timestamp = Utc::now();
        let max_x = frame.width as f32;
        let max_y = frame.height as f32;

        let detections = raw
            .into_iter()
            .filter(|det| det.score >= thresholds.confidence)
            .map(|det| {
                let [x1, y1, x2, y2] = det.bbox;
                let bbox = [
                    x1.clamp(0.0, max_x),
                    y1.clamp(0.0, max_y),
                    x2.clamp(0.0, max_x),
                    y2.clamp(0.0, max_y),
                ];
                let valid = bbox.iter().all(|v| v.is_finite()) && bbox[2] > bbox[0] && bbox[3] > bbox[1];
                DetectionRecord {
                    timestamp,
                    label: self.label_for(det.class_id),
                    confidence: det.score.clamp(0.0, 1.0),
                    bounding_box: valid.then(|| BoundingBox::from_xyxy(bbox)),
                }
            })
            .collect();

        Ok(FrameResult {
            frame_number,
            timestamp,
            detections,
        })
    }
}
