//! The capture, detect, annotate and publish loop that runs on the session
//! thread.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use metrics::{counter, gauge, histogram};
use ml_core::{Detector, FrameView, Thresholds};
use tracing::{debug, error, info, info_span, warn};
use video_ingest::{Frame, FrameSource};

use crate::{
    annotation::annotate,
    config::LoopTimings,
    counters::{CounterRules, Counters},
    data::LoopPhase,
    error::FrameProcessingError,
    store::FrameStore,
};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// State shared between a running loop and its controller.
#[derive(Debug, Default)]
pub struct LoopState {
    stop: AtomicBool,
    phase: AtomicU8,
    fps_bits: AtomicU32,
}

impl LoopState {
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> LoopPhase {
        LoopPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub(crate) fn set_phase(&self, phase: LoopPhase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    /// Smoothed processing rate of the running loop.
    pub fn fps(&self) -> f32 {
        f32::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    fn set_fps(&self, fps: f32) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }
}

/// Why [`DetectionLoop::run`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    /// Reopening the camera after repeated read failures did not work.
    CameraLost,
    /// The model never loaded, so the loop did not start.
    ModelUnavailable,
}

/// Outcome of a single [`DetectionLoop::step`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Published,
    /// A frame was read but could not be processed.
    Skipped,
    ReadFailed,
    /// The failure threshold was reached and the camera came back.
    Reopened,
    CameraLost,
}

pub struct DetectionLoop {
    source: FrameSource,
    detector: Detector,
    store: Arc<FrameStore>,
    rules: CounterRules,
    thresholds: Thresholds,
    timings: LoopTimings,
    state: Arc<LoopState>,
    counters: Counters,
    consecutive_failures: u32,
    frame_number: u64,
    fps: f32,
    last_frame_at: Option<Instant>,
}

impl DetectionLoop {
    /// `source` must already be open.
    pub fn new(
        source: FrameSource,
        detector: Detector,
        store: Arc<FrameStore>,
        rules: CounterRules,
        thresholds: Thresholds,
        timings: LoopTimings,
        state: Arc<LoopState>,
    ) -> Self {
        Self {
            source,
            detector,
            store,
            rules,
            thresholds,
            timings,
            state,
            counters: Counters::default(),
            consecutive_failures: 0,
            frame_number: 0,
            fps: 0.0,
            last_frame_at: None,
        }
    }

    /// Run until stopped or the camera is lost. The camera is released
    /// exactly once on the way out.
    pub fn run(mut self) -> StopReason {
        let session_span = info_span!(
            "detection.session",
            camera = self.source.active_index().unwrap_or(-1),
            classes = self.detector.labels().len(),
        );
        let _session_guard = session_span.enter();

        self.state.set_phase(LoopPhase::Looping);
        info!("detection loop started");

        let reason = loop {
            if self.state.stop_requested() {
                break StopReason::Requested;
            }
            if self.step() == StepOutcome::CameraLost {
                break StopReason::CameraLost;
            }
        };

        self.source.release();
        self.state.set_fps(0.0);
        self.state.set_phase(LoopPhase::Stopped);
        info!(?reason, frames = self.frame_number, "detection loop finished");
        reason
    }

    /// One iteration: read a frame and process it, or handle the failed read.
    pub fn step(&mut self) -> StepOutcome {
        match self.source.read() {
            Ok(frame) => {
                self.consecutive_failures = 0;
                self.state.set_phase(LoopPhase::Looping);
                let outcome = self.process(frame);
                self.pause(self.timings.throttle);
                outcome
            }
            Err(err) => self.handle_read_failure(err),
        }
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    fn process(&mut self, frame: Frame) -> StepOutcome {
        self.frame_number += 1;
        self.update_fps();

        let frame_number = self.frame_number;
        let frame_span = info_span!("detection.frame", frame = frame_number);
        let _frame_guard = frame_span.enter();
        let started = Instant::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.publish_frame(&frame)))
            .unwrap_or_else(|payload| Err(FrameProcessingError::Panicked(panic_message(&*payload))));

        match outcome {
            Ok(()) => {
                histogram!("ppe_frame_processing_seconds").record(started.elapsed().as_secs_f64());
                counter!("ppe_frames_processed_total").increment(1);
                StepOutcome::Published
            }
            Err(err) => {
                warn!(frame = frame_number, "skipping frame: {err}");
                counter!("ppe_frames_skipped_total").increment(1);
                StepOutcome::Skipped
            }
        }
    }

    fn publish_frame(&mut self, frame: &Frame) -> Result<(), FrameProcessingError> {
        let view = FrameView {
            bgr: &frame.data,
            width: frame.width as u32,
            height: frame.height as u32,
        };
        let stage = Instant::now();
        let result = self.detector.detect(view, self.frame_number, self.thresholds)?;
        histogram!("ppe_stage_seconds", "stage" => "detect").record(stage.elapsed().as_secs_f64());

        let stage = Instant::now();
        let annotated = annotate(frame, &result, &self.rules, self.fps)?;
        histogram!("ppe_stage_seconds", "stage" => "annotate").record(stage.elapsed().as_secs_f64());
        let counters = self.counters.update(&self.rules, &result.detections);
        debug!(
            detections = result.detections.len(),
            violations = counters.violation_count,
            "frame processed"
        );
        self.store.publish(annotated, result, counters);
        self.counters = counters;
        Ok(())
    }

    fn handle_read_failure(&mut self, err: video_ingest::CaptureError) -> StepOutcome {
        self.consecutive_failures += 1;
        self.state.set_phase(LoopPhase::Recovering);
        counter!("ppe_camera_read_failures_total").increment(1);
        warn!(
            failures = self.consecutive_failures,
            "failed to read frame: {err}"
        );

        let mut outcome = StepOutcome::ReadFailed;
        if self.consecutive_failures >= self.timings.max_consecutive_failures {
            info!(
                failures = self.consecutive_failures,
                "too many consecutive read failures, reopening camera"
            );
            counter!("ppe_camera_reopens_total").increment(1);
            match self.source.open() {
                Ok(index) => {
                    info!(index, "camera reopened");
                    self.consecutive_failures = 0;
                    outcome = StepOutcome::Reopened;
                }
                Err(err) => {
                    error!("failed to reopen camera, stopping detection: {err}");
                    return StepOutcome::CameraLost;
                }
            }
        }

        self.pause(self.timings.read_retry_backoff);
        outcome
    }

    fn update_fps(&mut self) {
        let now = Instant::now();
        if let Some(previous) = self.last_frame_at.replace(now) {
            let elapsed = now.duration_since(previous).as_secs_f32();
            if elapsed > 0.0 {
                self.fps = 0.9 * self.fps + 0.1 * (1.0 / elapsed);
            }
        }
        self.state.set_fps(self.fps);
        gauge!("ppe_detection_fps").set(self.fps as f64);
    }

    // Sleeps in slices so a stop request is noticed promptly.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if self.state.stop_requested() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
