//! Configuration for a detection pipeline.
//!
//! [`PipelineArgs`] is the CLI surface; it converts into a validated
//! [`PipelineConfig`] which every stage reads without re-parsing flags.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use clap::Args;
use ml_core::{ModelSource, Thresholds};
use video_ingest::{CaptureSettings, DEFAULT_DEVICE_INDICES, parse_device_index};

use crate::{
    annotation::PLACEHOLDER_MESSAGE,
    counters::CounterRules,
    store::HISTORY_CAPACITY,
};

/// Class vocabulary of the stock PPE detection model, indexed by class id.
pub const PPE_CLASS_NAMES: [&str; 10] = [
    "Hardhat",
    "Mask",
    "NO-Hardhat",
    "NO-Mask",
    "NO-Safety Vest",
    "Person",
    "Safety Cone",
    "Safety Vest",
    "machinery",
    "vehicle",
];

#[derive(Clone, Debug, PartialEq)]
pub struct LoopTimings {
    /// Pause after each processed frame.
    pub throttle: Duration,
    /// Pause after a failed read before trying again.
    pub read_retry_backoff: Duration,
    /// Consecutive failed reads that trigger a full camera reopen.
    pub max_consecutive_failures: u32,
}

impl Default for LoopTimings {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(30),
            read_retry_backoff: Duration::from_millis(500),
            max_consecutive_failures: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamOptions {
    /// Time between emissions for one consumer.
    pub interval: Duration,
    /// Pause after an emission had to be skipped.
    pub retry_pause: Duration,
    pub placeholder_width: u32,
    pub placeholder_height: u32,
    pub placeholder_message: String,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(33),
            retry_pause: Duration::from_millis(100),
            placeholder_width: 640,
            placeholder_height: 480,
            placeholder_message: PLACEHOLDER_MESSAGE.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub capture: CaptureSettings,
    /// Device indices tried in order when opening the camera.
    pub camera_indices: Vec<i32>,
    pub model: ModelSource,
    /// Overrides the class names shipped with the model.
    pub class_names: Option<Vec<String>>,
    pub thresholds: Thresholds,
    pub rules: CounterRules,
    pub history_capacity: usize,
    pub timings: LoopTimings,
    pub stream: StreamOptions,
    pub jpeg_quality: i32,
    /// Keep inference on the CPU even when an accelerator is present.
    pub use_cpu: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture: CaptureSettings::default(),
            camera_indices: DEFAULT_DEVICE_INDICES.to_vec(),
            model: ModelSource::new("best.pt"),
            class_names: None,
            thresholds: Thresholds::default(),
            rules: CounterRules::default(),
            history_capacity: HISTORY_CAPACITY,
            timings: LoopTimings::default(),
            stream: StreamOptions::default(),
            jpeg_quality: 85,
            use_cpu: false,
        }
    }
}

/// Pipeline flags shared by the binaries.
#[derive(Debug, Clone, Args)]
pub struct PipelineArgs {
    /// Detection model path.
    #[arg(long = "model", value_name = "PATH", default_value = "best.pt")]
    pub model: PathBuf,
    /// Allow loading pickle checkpoints, which can run code while loading.
    #[arg(long = "trust-model-source", action = clap::ArgAction::SetTrue)]
    pub trust_model_source: bool,
    /// Camera index or /dev/videoN path; repeat to set the search order.
    #[arg(long = "camera", value_name = "DEVICE")]
    pub cameras: Vec<String>,
    /// Capture width in pixels.
    #[arg(long = "width", value_name = "PX", default_value_t = 640)]
    pub width: i32,
    /// Capture height in pixels.
    #[arg(long = "height", value_name = "PX", default_value_t = 480)]
    pub height: i32,
    /// Requested capture frame rate.
    #[arg(long = "fps", value_name = "FPS", default_value_t = 30.0)]
    pub fps: f64,
    /// Minimum detection confidence (0-1).
    #[arg(long = "confidence", value_name = "SCORE", default_value_t = 0.25)]
    pub confidence: f32,
    /// IoU threshold for non-maximum suppression (0-1).
    #[arg(long = "iou", value_name = "IOU", default_value_t = 0.45)]
    pub iou: f32,
    /// File with one class name per line, overriding the model's names.
    #[arg(long = "labels", value_name = "PATH")]
    pub labels: Option<PathBuf>,
    /// Label prefix counted as a violation; repeatable.
    #[arg(long = "violation-prefix", value_name = "PREFIX", default_values_t = ["NO-".to_string()])]
    pub violation_prefixes: Vec<String>,
    /// Label counted as a helmet; repeatable.
    #[arg(long = "helmet-label", value_name = "LABEL", default_values_t = ["Hardhat".to_string(), "helmet".to_string()])]
    pub helmet_labels: Vec<String>,
    /// Label counted as a vest; repeatable.
    #[arg(long = "vest-label", value_name = "LABEL", default_values_t = ["Safety Vest".to_string(), "vest".to_string()])]
    pub vest_labels: Vec<String>,
    /// JPEG quality for the stream (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 85)]
    pub jpeg_quality: i32,
    /// Milliseconds between stream emissions per consumer.
    #[arg(long = "stream-interval-ms", value_name = "MS", default_value_t = 33)]
    pub stream_interval_ms: u64,
    /// Milliseconds to pause after each processed frame.
    #[arg(long = "throttle-ms", value_name = "MS", default_value_t = 30)]
    pub throttle_ms: u64,
    /// Milliseconds to wait after a failed frame read.
    #[arg(long = "retry-backoff-ms", value_name = "MS", default_value_t = 500)]
    pub retry_backoff_ms: u64,
    /// Consecutive failed reads before the camera is reopened.
    #[arg(long = "max-read-failures", value_name = "N", default_value_t = 10)]
    pub max_read_failures: u32,
    /// Detection results kept for the results endpoint.
    #[arg(long = "history", value_name = "N", default_value_t = HISTORY_CAPACITY)]
    pub history: usize,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
}

impl TryFrom<PipelineArgs> for PipelineConfig {
    type Error = anyhow::Error;

    fn try_from(args: PipelineArgs) -> Result<Self> {
        if args.width <= 0 || args.height <= 0 {
            bail!("Capture width and height must be positive integers");
        }
        if !(args.fps > 0.0) {
            bail!("--fps must be positive");
        }
        if !(0.0..=1.0).contains(&args.confidence) {
            bail!("--confidence must be between 0 and 1");
        }
        if !(0.0..=1.0).contains(&args.iou) {
            bail!("--iou must be between 0 and 1");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if args.history == 0 {
            bail!("--history must be at least 1");
        }
        if args.max_read_failures == 0 {
            bail!("--max-read-failures must be at least 1");
        }
        if args.stream_interval_ms == 0 {
            bail!("--stream-interval-ms must be at least 1");
        }

        let camera_indices = if args.cameras.is_empty() {
            DEFAULT_DEVICE_INDICES.to_vec()
        } else {
            args.cameras
                .iter()
                .map(|camera| {
                    parse_device_index(camera)
                        .with_context(|| format!("--camera {camera:?} is not a device index"))
                })
                .collect::<Result<Vec<_>>>()?
        };

        let rules = CounterRules {
            violation_prefixes: non_empty(args.violation_prefixes, "--violation-prefix")?,
            helmet_labels: non_empty(args.helmet_labels, "--helmet-label")?,
            vest_labels: non_empty(args.vest_labels, "--vest-label")?,
        };

        let class_names = args
            .labels
            .as_ref()
            .map(|path| {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read labels file {}", path.display()))?;
                let names = parse_class_names(&text);
                if names.is_empty() {
                    bail!("Labels file {} contains no class names", path.display());
                }
                Ok(names)
            })
            .transpose()?;

        Ok(Self {
            capture: CaptureSettings {
                width: args.width,
                height: args.height,
                fps: args.fps,
            },
            camera_indices,
            model: ModelSource::new(args.model).trusted(args.trust_model_source),
            class_names,
            thresholds: Thresholds {
                confidence: args.confidence,
                iou: args.iou,
            },
            rules,
            history_capacity: args.history,
            timings: LoopTimings {
                throttle: Duration::from_millis(args.throttle_ms),
                read_retry_backoff: Duration::from_millis(args.retry_backoff_ms),
                max_consecutive_failures: args.max_read_failures,
            },
            stream: StreamOptions {
                interval: Duration::from_millis(args.stream_interval_ms),
                ..StreamOptions::default()
            },
            jpeg_quality: args.jpeg_quality,
            use_cpu: args.use_cpu,
        })
    }
}

/// One class name per line; blank lines and `#` comments are ignored.
pub fn parse_class_names(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn non_empty(values: Vec<String>, flag: &str) -> Result<Vec<String>> {
    if values.iter().any(|value| value.is_empty()) {
        bail!("{flag} values must not be empty");
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        pipeline: PipelineArgs,
    }

    fn parse(extra: &[&str]) -> Result<PipelineConfig> {
        let argv = std::iter::once("ppe").chain(extra.iter().copied());
        PipelineConfig::try_from(Harness::try_parse_from(argv)?.pipeline)
    }

    #[test]
    fn cli_defaults_match_library_defaults() {
        assert_eq!(parse(&[]).unwrap(), PipelineConfig::default());
    }

    #[test]
    fn cameras_accept_indices_and_device_paths() {
        let config = parse(&["--camera", "/dev/video2", "--camera", "0"]).unwrap();
        assert_eq!(config.camera_indices, vec![2, 0]);
        assert!(parse(&["--camera", "rtsp://cam"]).is_err());
    }

    #[test]
    fn vocabulary_flags_replace_defaults() {
        let config = parse(&["--helmet-label", "casco", "--violation-prefix", "missing_"]).unwrap();
        assert_eq!(config.rules.helmet_labels, vec!["casco".to_string()]);
        assert_eq!(config.rules.violation_prefixes, vec!["missing_".to_string()]);
        assert_eq!(config.rules.vest_labels, CounterRules::default().vest_labels);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(parse(&["--confidence", "1.5"]).is_err());
        assert!(parse(&["--jpeg-quality", "0"]).is_err());
        assert!(parse(&["--history", "0"]).is_err());
        assert!(parse(&["--max-read-failures", "0"]).is_err());
        assert!(parse(&["--width", "-1"]).is_err());
    }

    #[test]
    fn trust_flag_reaches_model_source() {
        let config = parse(&["--model", "ppe.torchscript", "--trust-model-source"]).unwrap();
        assert_eq!(config.model.path, PathBuf::from("ppe.torchscript"));
        assert!(config.model.trust_source);
    }

    #[test]
    fn class_name_files_skip_comments_and_blanks() {
        let names = parse_class_names("# ppe\nHardhat\n\n  NO-Hardhat  \n");
        assert_eq!(names, vec!["Hardhat".to_string(), "NO-Hardhat".to_string()]);
    }
}
