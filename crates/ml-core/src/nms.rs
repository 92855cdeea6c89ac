//! Decoding and class-wise non-maximum suppression of raw model output.

use std::cmp::Ordering;

use crate::model::RawDetection;

/// Intersection over union of two `[x1, y1, x2, y2]` boxes.
#[inline]
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);

    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    if inter == 0.0 {
        return 0.0;
    }

    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    inter / (area_a + area_b - inter + 1e-6)
}

/// Decode YOLO-style `[cx, cy, w, h, class scores...]` rows into frame-pixel
/// boxes. Each row keeps its best class; rows below `confidence` or without
/// any class score are dropped. `scale` maps model input pixels to frame
/// pixels.
pub fn decode_rows<R: AsRef<[f32]>>(
    rows: &[R],
    confidence: f32,
    scale: (f32, f32),
) -> Vec<RawDetection> {
    let (scale_x, scale_y) = scale;
    rows.iter()
        .filter_map(|row| {
            let row = row.as_ref();
            let (class_id, score) = row
                .get(4..)?
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))?;
            if score < confidence {
                return None;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2].abs(), row[3].abs());
            Some(RawDetection {
                class_id,
                score,
                bbox: [
                    (cx - w * 0.5) * scale_x,
                    (cy - h * 0.5) * scale_y,
                    (cx + w * 0.5) * scale_x,
                    (cy + h * 0.5) * scale_y,
                ],
            })
        })
        .collect()
}

/// Greedy NMS per class. Output is ordered by descending score.
pub fn classwise_nms(
    mut candidates: Vec<RawDetection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<RawDetection> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept: Vec<RawDetection> = Vec::with_capacity(candidates.len().min(max_detections));
    for candidate in candidates {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept.iter().any(|existing| {
            existing.class_id == candidate.class_id
                && iou(&existing.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
