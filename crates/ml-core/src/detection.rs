//! Normalised detection records shared by the pipeline and its consumers.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Axis-aligned box in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn from_xyxy([x1, y1, x2, y2]: [f32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

/// One labelled object found in a frame. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
}

/// All detections for one processed frame, in model output order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameResult {
    pub frame_number: u64,
    pub timestamp: DateTime<Utc>,
    pub detections: Vec<DetectionRecord>,
}

impl FrameResult {
    pub fn empty(frame_number: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            frame_number,
            timestamp,
            detections: Vec::new(),
        }
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.detections.iter().map(|det| det.label.as_str())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn serialises_with_optional_box() {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let result = FrameResult {
            frame_number: 4,
            timestamp,
            detections: vec![
                DetectionRecord {
                    timestamp,
                    label: "Hardhat".into(),
                    confidence: 0.5,
                    bounding_box: Some(BoundingBox::from_xyxy([1.0, 2.0, 3.0, 4.0])),
                },
                DetectionRecord {
                    timestamp,
                    label: "NO-Mask".into(),
                    confidence: 0.25,
                    bounding_box: None,
                },
            ],
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["frame_number"], 4);
        assert_eq!(value["timestamp"], "2024-05-01T12:00:00Z");
        assert_eq!(
            value["detections"][0]["bounding_box"],
            json!({"x1": 1.0, "y1": 2.0, "x2": 3.0, "y2": 4.0})
        );
        assert!(value["detections"][1].get("bounding_box").is_none());
        assert_eq!(result.labels().collect::<Vec<_>>(), vec!["Hardhat", "NO-Mask"]);
    }
}
