use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use vision::{PipelineArgs, TelemetryOptions};

/// PPE monitor: camera capture, detection and an HTTP control surface.
#[derive(Debug, Parser)]
#[command(name = "ppe-monitor", version, args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

impl Cli {
    /// `serve` is the default when no subcommand is given.
    pub fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Serve(self.serve))
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP API and MJPEG stream (default).
    Serve(ServeArgs),
    /// Run detection on an image or video file and print the results as JSON.
    Detect(DetectArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind.
    #[arg(long = "host", value_name = "HOST", default_value = "0.0.0.0")]
    pub host: String,
    /// Port to bind.
    #[arg(long = "port", value_name = "PORT", default_value_t = 5000)]
    pub port: u16,

    #[command(flatten)]
    pub pipeline: PipelineArgs,

    #[command(flatten)]
    pub telemetry: TelemetryArgs,
}

#[derive(Debug, Clone, Args)]
pub struct DetectArgs {
    /// Image or video file to analyse.
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,
    /// Write the annotated image or video here. Videos default to
    /// `processed_<name>` next to the input.
    #[arg(long = "output", value_name = "PATH")]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub pipeline: PipelineArgs,

    #[command(flatten)]
    pub telemetry: TelemetryArgs,
}

const VIDEO_EXTENSIONS: [&str; 7] = ["mp4", "avi", "mov", "mkv", "webm", "m4v", "mpg"];

impl DetectArgs {
    pub fn is_video(&self) -> bool {
        self.input
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| VIDEO_EXTENSIONS.iter().any(|v| ext.eq_ignore_ascii_case(v)))
    }

    /// Where annotated video goes.
    pub fn video_output(&self) -> PathBuf {
        if let Some(output) = &self.output {
            return output.clone();
        }
        let name = self
            .input
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video.mp4".into());
        self.input
            .parent()
            .unwrap_or(Path::new(""))
            .join(format!("processed_{name}"))
    }
}

#[derive(Debug, Clone, Args)]
pub struct TelemetryArgs {
    /// Write a Chrome trace of pipeline spans to this file.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

impl From<&TelemetryArgs> for TelemetryOptions {
    fn from(args: &TelemetryArgs) -> Self {
        TelemetryOptions {
            chrome_trace_path: args.chrome_trace.clone(),
            verbose: args.verbose,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["ppe-monitor", "--port", "8080", "--camera", "1"]).unwrap();
        match cli.into_command() {
            Command::Serve(args) => {
                assert_eq!(args.host, "0.0.0.0");
                assert_eq!(args.port, 8080);
                assert_eq!(args.pipeline.cameras, vec!["1".to_string()]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn detect_takes_an_image() {
        let cli =
            Cli::try_parse_from(["ppe-monitor", "detect", "site.jpg", "--confidence", "0.5"])
                .unwrap();
        match cli.into_command() {
            Command::Detect(args) => {
                assert_eq!(args.input, PathBuf::from("site.jpg"));
                assert_eq!(args.pipeline.confidence, 0.5);
                assert!(args.output.is_none());
                assert!(!args.is_video());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    fn detect_args(argv: &[&str]) -> DetectArgs {
        let cli = Cli::try_parse_from(argv.iter().copied()).unwrap();
        match cli.into_command() {
            Command::Detect(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn video_inputs_are_recognised_by_extension() {
        let args = detect_args(&["ppe-monitor", "detect", "footage/gate.MP4"]);
        assert!(args.is_video());
        assert_eq!(args.video_output(), PathBuf::from("footage/processed_gate.MP4"));

        let args = detect_args(&["ppe-monitor", "detect", "gate.avi", "--output", "out.mp4"]);
        assert!(args.is_video());
        assert_eq!(args.video_output(), PathBuf::from("out.mp4"));

        assert!(!detect_args(&["ppe-monitor", "detect", "gate.png"]).is_video());
    }
}
