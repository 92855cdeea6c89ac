//! Offline detection for the `detect` command: a still image, or every frame
//! of a video file.

use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use image::RgbImage;
use ml_core::{Detector, FrameResult, FrameView, Thresholds};
use serde::Serialize;
use tracing::{debug, info};
use video_ingest::{Frame, FrameFormat, FrameSink, FrameSource};

use crate::{
    annotation::annotate,
    counters::{CounterRules, Counters},
};

#[derive(Clone, Debug, Serialize)]
pub struct ImageAnalysis {
    pub result: FrameResult,
    pub counters: Counters,
}

/// Per-frame results of a video and the totals over all of them.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VideoAnalysis {
    pub frames: Vec<FrameResult>,
    pub counters: Counters,
}

/// Wrap an RGB image as a captured BGR frame.
pub fn frame_from_rgb(image: &RgbImage) -> Frame {
    let data = image
        .as_raw()
        .chunks_exact(3)
        .flat_map(|px| [px[2], px[1], px[0]])
        .collect();
    Frame {
        data,
        width: image.width() as i32,
        height: image.height() as i32,
        timestamp_ms: Utc::now().timestamp_millis(),
        format: FrameFormat::Bgr8,
    }
}

/// Detect on `image` and count the result as a one-frame session.
pub fn analyze_image(
    detector: &mut Detector,
    image: &RgbImage,
    thresholds: Thresholds,
    rules: &CounterRules,
) -> Result<(ImageAnalysis, Frame)> {
    let frame = frame_from_rgb(image);
    let view = FrameView {
        bgr: &frame.data,
        width: image.width(),
        height: image.height(),
    };
    let result = detector
        .detect(view, 1, thresholds)
        .context("detection failed")?;
    let counters = Counters::default().update(rules, &result.detections);
    Ok((ImageAnalysis { result, counters }, frame))
}

/// Load `input`, detect, and optionally write the annotated image to `output`.
pub fn analyze_file(
    detector: &mut Detector,
    input: &Path,
    output: Option<&Path>,
    thresholds: Thresholds,
    rules: &CounterRules,
) -> Result<ImageAnalysis> {
    let image = image::open(input)
        .with_context(|| format!("failed to open image {}", input.display()))?
        .to_rgb8();
    let (analysis, frame) = analyze_image(detector, &image, thresholds, rules)?;

    if let Some(output) = output {
        let annotated = annotate(&frame, &analysis.result, rules, 0.0)?;
        annotated
            .image
            .save(output)
            .with_context(|| format!("failed to write {}", output.display()))?;
    }
    Ok(analysis)
}

/// Detect on every frame of an opened video `source` until it runs out.
///
/// Annotated frames go to `sink` when one is given. `on_frame` sees each
/// result as soon as it is produced. The source is released afterwards.
pub fn analyze_video(
    detector: &mut Detector,
    source: &mut FrameSource,
    mut sink: Option<&mut dyn FrameSink>,
    thresholds: Thresholds,
    rules: &CounterRules,
    mut on_frame: impl FnMut(&FrameResult),
) -> Result<VideoAnalysis> {
    if !source.is_open() {
        bail!("video source is not open");
    }
    let fps = source.fps() as f32;
    let mut analysis = VideoAnalysis::default();

    loop {
        let frame = match source.read() {
            Ok(frame) => frame,
            Err(err) if err.is_read_error() => {
                debug!("end of video: {err}");
                break;
            }
            Err(err) => return Err(err).context("failed to read video frame"),
        };
        let frame_number = analysis.frames.len() as u64 + 1;
        let view = FrameView {
            bgr: &frame.data,
            width: frame.width as u32,
            height: frame.height as u32,
        };
        let result = detector
            .detect(view, frame_number, thresholds)
            .with_context(|| format!("detection failed on frame {frame_number}"))?;
        analysis.counters = analysis.counters.update(rules, &result.detections);

        if let Some(sink) = sink.as_deref_mut() {
            let annotated = annotate(&frame, &result, rules, fps)?;
            sink.write(&frame_from_rgb(&annotated.image))
                .with_context(|| format!("failed to write frame {frame_number}"))?;
        }
        on_frame(&result);
        analysis.frames.push(result);
    }

    if let Some(sink) = sink {
        sink.finish();
    }
    source.release();
    info!(
        frames = analysis.frames.len(),
        violations = analysis.counters.violation_count,
        "video analysed"
    );
    Ok(analysis)
}
