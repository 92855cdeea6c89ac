//! PPE detection pipeline: capture, detect, annotate and publish.
//!
//! A [`PipelineContext`] owns at most one detection session. The session's
//! loop thread reads frames from a [`video_ingest::FrameSource`], runs the
//! [`ml_core::Detector`], draws annotations, folds detections into
//! [`Counters`] and publishes everything to the [`FrameStore`]. HTTP
//! handlers read the store and turn it into status, results and the MJPEG
//! stream produced by [`mjpeg_stream`].

pub mod analyze;
pub mod annotation;
pub mod config;
pub mod counters;
pub mod data;
pub mod encoding;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod stream;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use analyze::{ImageAnalysis, VideoAnalysis, analyze_file, analyze_image, analyze_video};
pub use config::{LoopTimings, PPE_CLASS_NAMES, PipelineArgs, PipelineConfig, StreamOptions};
pub use counters::{Bucket, CounterRules, Counters};
pub use data::{AnnotatedFrame, ControlReply, LoopPhase, ResultsReport, StatusReport};
pub use encoding::{FrameEncoder, JpegFrameEncoder};
pub use error::{EncodeError, FrameProcessingError};
pub use pipeline::{PipelineContext, TelemetryGuard, TelemetryOptions, telemetry};
pub use store::{FrameStore, HISTORY_CAPACITY, LatestFrame, Snapshot};
pub use stream::{
    MULTIPART_CONTENT_TYPE, encode_emission, encode_with_fallback, mjpeg_stream, multipart_chunk,
};
