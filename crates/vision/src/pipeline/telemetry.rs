//! Tracing subscribers, the Prometheus recorder, and thread spawning that
//! keeps spans attached across the capture thread boundary.

use std::{
    io,
    path::{Path, PathBuf},
    sync::OnceLock,
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    prelude::*,
};

static PROM_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

#[derive(Clone, Debug, Default)]
pub struct TelemetryOptions {
    /// Write span timings in Chrome trace format to this file.
    pub chrome_trace_path: Option<PathBuf>,
    /// Default to `debug` when `RUST_LOG` is unset.
    pub verbose: bool,
}

/// Keeps the Chrome trace writer alive; the trace is flushed on drop.
pub struct TelemetryGuard {
    chrome_guard: Option<tracing_chrome::FlushGuard>,
    chrome_trace_path: Option<PathBuf>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.chrome_guard.take() {
            guard.flush();
            if let Some(path) = self.chrome_trace_path.as_ref() {
                tracing::info!(path = %path.display(), "chrome trace written");
            }
        }
    }
}

/// Install the process-wide subscriber. Fails if one is already installed.
pub fn init(opts: &TelemetryOptions) -> Result<TelemetryGuard> {
    let default_level = if opts.verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_ref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                eprintln!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(chrome_layer.map(|layer| layer.with_filter(filter_fn(|meta| meta.is_span()))))
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_filter(env_filter),
        )
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(TelemetryGuard {
        chrome_guard,
        chrome_trace_path: opts.chrome_trace_path.clone(),
    })
}

/// Install the global metrics recorder once and return the Prometheus handle.
///
/// Returns `None` when another recorder already owns the global slot, in
/// which case metrics from this crate go to that recorder instead.
pub fn init_metrics_recorder() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if let Err(err) = metrics::set_global_recorder(recorder) {
                tracing::warn!("metrics recorder not installed: {err}");
                return None;
            }

            let upkeep_handle = handle.clone();
            let upkeep = spawn_thread("prometheus-upkeep", move || {
                loop {
                    thread::sleep(Duration::from_secs(5));
                    upkeep_handle.run_upkeep();
                }
            });
            if let Err(err) = upkeep {
                tracing::warn!("prometheus upkeep thread not started: {err}");
            }
            Some(handle)
        })
        .as_ref()
}

/// The Prometheus handle, if [`init_metrics_recorder`] installed one.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get().and_then(Option::as_ref)
}

/// Spawn a named thread that inherits the current tracing dispatcher.
pub(crate) fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> io::Result<(
    tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
    tracing_chrome::FlushGuard,
)> {
    let file = std::fs::File::create(path)?;
    Ok(tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_threads_keep_their_name() {
        let handle = spawn_thread("telemetry-test", || {
            thread::current().name().map(str::to_string)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("telemetry-test"));
    }

    #[test]
    fn metrics_recorder_installs_once() {
        let first = init_metrics_recorder().map(|h| h as *const PrometheusHandle);
        let second = init_metrics_recorder().map(|h| h as *const PrometheusHandle);
        assert_eq!(first, second);
        assert_eq!(prometheus_handle().is_some(), first.is_some());
    }
}
