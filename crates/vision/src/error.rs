use ml_core::ModelError;
use thiserror::Error;

/// A single frame could not be turned into a published result. The frame is
/// skipped; the session carries on.
#[derive(Debug, Error)]
pub enum FrameProcessingError {
    #[error(transparent)]
    Detection(#[from] ModelError),
    #[error("frame is unusable: {0}")]
    InvalidFrame(String),
    #[error("frame processing panicked: {0}")]
    Panicked(String),
}

/// Image encoding failed. Streams fall back to the placeholder.
#[derive(Debug, Error)]
#[error("failed to encode frame: {0}")]
pub struct EncodeError(pub String);
