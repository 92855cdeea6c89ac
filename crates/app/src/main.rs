mod backends;
mod cli;
mod server;

use std::sync::Arc;

use actix_web::web;
use anyhow::{Context, Result};
use clap::Parser;
use ml_core::Detector;
use tracing::info;
use vision::{JpegFrameEncoder, PipelineConfig, PipelineContext, TelemetryOptions, telemetry};

use crate::{
    cli::{Cli, Command, DetectArgs, ServeArgs},
    server::AppState,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    match Cli::parse().into_command() {
        Command::Serve(args) => run_server(args),
        Command::Detect(args) => run_detect(args),
    }
}

fn run_server(args: ServeArgs) -> Result<()> {
    let _telemetry = telemetry::init(&TelemetryOptions::from(&args.telemetry))?;
    telemetry::init_metrics_recorder();

    let config = PipelineConfig::try_from(args.pipeline)?;
    let loader = backends::model_loader(&config);
    let encoder = Arc::new(JpegFrameEncoder::new(config.jpeg_quality));
    let stream = config.stream.clone();
    let pipeline = Arc::new(PipelineContext::new(
        config,
        backends::camera_backend(),
        loader,
    ));

    let state = web::Data::new(AppState {
        pipeline: pipeline.clone(),
        encoder,
        stream,
    });
    let served = actix_web::rt::System::new().block_on(server::serve(&args.host, args.port, state));

    if pipeline.is_running() {
        let reply = pipeline.stop();
        info!(message = %reply.message, "session stopped on shutdown");
    }
    served
}

fn run_detect(args: DetectArgs) -> Result<()> {
    let _telemetry = telemetry::init(&TelemetryOptions::from(&args.telemetry))?;

    let config = PipelineConfig::try_from(args.pipeline.clone())?;
    let loader = backends::model_loader(&config);
    let mut detector = Detector::load(loader.as_ref(), &config.model, config.class_names.clone())
        .with_context(|| format!("failed to load model {}", config.model.path.display()))?;

    if args.is_video() {
        return run_detect_video(&args, &mut detector, &config);
    }

    let analysis = vision::analyze_file(
        &mut detector,
        &args.input,
        args.output.as_deref(),
        config.thresholds,
        &config.rules,
    )?;
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

/// Prints one JSON line per frame, then the totals.
#[cfg(feature = "opencv")]
fn run_detect_video(
    args: &DetectArgs,
    detector: &mut Detector,
    config: &PipelineConfig,
) -> Result<()> {
    use video_ingest::{FrameSource, OpenCvVideoWriter};

    let mut source = FrameSource::new(backends::camera_backend(), Vec::new(), config.capture);
    source
        .open_file(&args.input)
        .with_context(|| format!("failed to open video {}", args.input.display()))?;
    let output = args.video_output();
    let mut writer = OpenCvVideoWriter::new(&output, source.fps());

    let mut print_err = None;
    let analysis = vision::analyze_video(
        detector,
        &mut source,
        Some(&mut writer),
        config.thresholds,
        &config.rules,
        |result| match serde_json::to_string(result) {
            Ok(line) => println!("{line}"),
            Err(err) => {
                print_err.get_or_insert(err);
            }
        },
    )?;
    if let Some(err) = print_err {
        return Err(err).context("failed to serialise a frame result");
    }

    let totals = serde_json::json!({
        "frames": analysis.frames.len(),
        "counters": analysis.counters,
        "output": output,
    });
    println!("{}", serde_json::to_string_pretty(&totals)?);
    info!(output = %output.display(), "annotated video written");
    Ok(())
}

#[cfg(not(feature = "opencv"))]
fn run_detect_video(
    args: &DetectArgs,
    _detector: &mut Detector,
    _config: &PipelineConfig,
) -> Result<()> {
    anyhow::bail!(
        "cannot read video {}: video support not compiled in (enable the `opencv` feature)",
        args.input.display()
    )
}
