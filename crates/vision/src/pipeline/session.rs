//! Session control: at most one detection loop per context.
//!
//! `start` opens the camera on the caller's thread, then spawns the loop
//! thread, which loads the model and reports back over a rendezvous channel
//! before entering the loop. `stop` signals the loop and joins it, so the
//! camera is released by the time the reply is sent.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::JoinHandle,
};

use ml_core::{Detector, ModelLoader};
use tracing::{error, info, warn};
use video_ingest::{CameraBackend, FrameSource};

use crate::{
    annotation::placeholder_frame,
    config::PipelineConfig,
    data::{ControlReply, LoopPhase, ResultsReport, StatusReport},
    pipeline::{
        detection_loop::{DetectionLoop, LoopState, StopReason},
        telemetry,
    },
    store::FrameStore,
};

struct SessionSlot {
    state: Arc<LoopState>,
    handle: Option<JoinHandle<StopReason>>,
}

impl SessionSlot {
    fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

/// Owns the shared store and the (at most one) running session.
pub struct PipelineContext {
    config: PipelineConfig,
    camera: Arc<dyn CameraBackend>,
    loader: Arc<dyn ModelLoader>,
    store: Arc<FrameStore>,
    control: Mutex<()>,
    slot: Mutex<SessionSlot>,
}

impl PipelineContext {
    pub fn new(
        config: PipelineConfig,
        camera: Arc<dyn CameraBackend>,
        loader: Arc<dyn ModelLoader>,
    ) -> Self {
        let placeholder = placeholder_frame(
            config.stream.placeholder_width,
            config.stream.placeholder_height,
            &config.stream.placeholder_message,
        );
        let store = Arc::new(FrameStore::new(config.history_capacity, placeholder));
        Self {
            config,
            camera,
            loader,
            store,
            control: Mutex::new(()),
            slot: Mutex::new(SessionSlot {
                state: Arc::new(LoopState::default()),
                handle: None,
            }),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<FrameStore> {
        self.store.clone()
    }

    /// Start a session. Blocks until the camera is open and the model has
    /// loaded, or until either fails. Status reads are not blocked meanwhile.
    pub fn start(&self) -> ControlReply {
        let _control = self.lock_control();
        {
            let mut slot = self.lock_slot();
            if slot.is_running() {
                return ControlReply::rejected("Detection already running");
            }
            if let Some(handle) = slot.handle.take() {
                reap(handle);
            }
        }

        let mut source = FrameSource::new(
            self.camera.clone(),
            self.config.camera_indices.clone(),
            self.config.capture,
        );
        let camera_index = match source.open() {
            Ok(index) => index,
            Err(err) => {
                warn!("detection start rejected: {err}");
                return ControlReply::rejected(format!("Failed to initialize camera: {err}"));
            }
        };

        self.store.reset();
        let state = Arc::new(LoopState::default());
        state.set_phase(LoopPhase::Starting);

        let (init_tx, init_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);
        let loader = self.loader.clone();
        let model = self.config.model.clone();
        let class_names = self.config.class_names.clone();
        let store = self.store.clone();
        let rules = self.config.rules.clone();
        let thresholds = self.config.thresholds;
        let timings = self.config.timings.clone();
        let loop_state = state.clone();

        let spawned = telemetry::spawn_thread("ppe-detection", move || {
            let detector = match Detector::load(loader.as_ref(), &model, class_names) {
                Ok(detector) => {
                    let _ = init_tx.send(Ok(()));
                    detector
                }
                Err(err) => {
                    error!("detection model failed to load: {err}");
                    drop(source);
                    loop_state.set_phase(LoopPhase::Stopped);
                    let _ = init_tx.send(Err(err.to_string()));
                    return StopReason::ModelUnavailable;
                }
            };
            DetectionLoop::new(
                source, detector, store, rules, thresholds, timings, loop_state,
            )
            .run()
        });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                state.set_phase(LoopPhase::Stopped);
                self.lock_slot().state = state;
                return ControlReply::rejected(format!(
                    "Failed to start detection thread: {err}"
                ));
            }
        };
        {
            let mut slot = self.lock_slot();
            slot.state = state.clone();
            slot.handle = Some(handle);
        }

        let outcome = init_rx.recv();
        if let Ok(Ok(())) = outcome {
            info!(camera = camera_index, "detection started");
            return ControlReply::ok("Detection started");
        }

        let handle = self.lock_slot().handle.take();
        if let Some(handle) = handle {
            reap(handle);
        }
        state.set_phase(LoopPhase::Stopped);
        match outcome {
            Ok(Err(reason)) => {
                ControlReply::rejected(format!("Failed to load detection model: {reason}"))
            }
            _ => ControlReply::rejected(
                "Failed to load detection model: loader exited unexpectedly",
            ),
        }
    }

    /// Signal the loop and wait for it to release the camera.
    pub fn stop(&self) -> ControlReply {
        let _control = self.lock_control();
        let (handle, state) = {
            let mut slot = self.lock_slot();
            (slot.handle.take(), slot.state.clone())
        };
        let Some(handle) = handle else {
            return ControlReply::rejected("Detection not running");
        };
        if handle.is_finished() {
            reap(handle);
            return ControlReply::rejected("Detection not running");
        }

        state.request_stop();
        reap(handle);
        info!("detection stopped");
        ControlReply::ok("Detection stopped")
    }

    pub fn is_running(&self) -> bool {
        self.lock_slot().is_running()
    }

    pub fn phase(&self) -> LoopPhase {
        self.lock_slot().state.phase()
    }

    pub fn status(&self) -> StatusReport {
        let (active, state, fps) = {
            let slot = self.lock_slot();
            (slot.is_running(), slot.state.phase(), slot.state.fps())
        };
        let (counters, frames) = self.store.counters();
        StatusReport {
            active,
            violations: counters.violation_count,
            helmets: counters.helmet_count,
            vests: counters.vest_count,
            state,
            frames,
            fps,
        }
    }

    pub fn results(&self) -> ResultsReport {
        ResultsReport {
            results: self.store.history(),
        }
    }

    fn lock_control(&self) -> MutexGuard<'_, ()> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_slot(&self) -> MutexGuard<'_, SessionSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PipelineContext {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.handle.take() {
            slot.state.request_stop();
            reap(handle);
        }
    }
}

fn reap(handle: JoinHandle<StopReason>) {
    match handle.join() {
        Ok(reason) => info!(?reason, "detection session ended"),
        Err(_) => error!("detection thread panicked"),
    }
}
