use image::RgbImage;
use ml_core::FrameResult;
use serde::Serialize;

/// A fully drawn frame, frozen once published.
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub image: RgbImage,
    pub frame_number: u64,
    pub timestamp_ms: i64,
    pub fps: f32,
}

impl AnnotatedFrame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Where the detection loop currently is. `Idle` means no session has run yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopPhase {
    Idle,
    Starting,
    Looping,
    Recovering,
    Stopped,
}

impl LoopPhase {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            LoopPhase::Idle => 0,
            LoopPhase::Starting => 1,
            LoopPhase::Looping => 2,
            LoopPhase::Recovering => 3,
            LoopPhase::Stopped => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => LoopPhase::Starting,
            2 => LoopPhase::Looping,
            3 => LoopPhase::Recovering,
            4 => LoopPhase::Stopped,
            _ => LoopPhase::Idle,
        }
    }
}

/// Reply to a start or stop request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ControlReply {
    pub success: bool,
    pub message: String,
}

impl ControlReply {
    pub(crate) fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub(crate) fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusReport {
    pub active: bool,
    pub violations: u64,
    pub helmets: u64,
    pub vests: u64,
    pub state: LoopPhase,
    pub frames: u64,
    pub fps: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultsReport {
    pub results: Vec<FrameResult>,
}
