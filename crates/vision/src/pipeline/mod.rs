//! Detection session runtime: the loop, its controller and telemetry.

pub mod detection_loop;
pub mod session;
pub mod telemetry;

pub use detection_loop::{DetectionLoop, LoopState, StepOutcome, StopReason};
pub use session::PipelineContext;
pub use telemetry::{TelemetryGuard, TelemetryOptions};
