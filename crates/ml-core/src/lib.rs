//! Detector adapter for the PPE pipeline.
//!
//! The model itself is opaque: anything implementing [`DetectionModel`] can be
//! plugged in through a [`ModelLoader`]. [`Detector`] resolves class ids to
//! labels and produces the [`FrameResult`] records the rest of the pipeline
//! consumes. Enable `with-tch` for the TorchScript backend.

pub mod detection;
pub mod detector;
pub mod model;
pub mod nms;
#[cfg(feature = "with-tch")]
pub mod torchscript;

pub use detection::{BoundingBox, DetectionRecord, FrameResult};
pub use detector::Detector;
pub use model::{
    DetectionModel, FrameView, ModelError, ModelFormat, ModelLoader, ModelSource, RawDetection,
    Thresholds, classify_archive, verify_source,
};

#[cfg(feature = "with-tch")]
pub use tch;
