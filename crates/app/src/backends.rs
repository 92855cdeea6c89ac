//! Camera and model backends compiled into this binary.
//!
//! Without the `opencv` or `with-tch` features the server still runs; start
//! requests then fail with a message naming the missing feature.

use std::sync::Arc;

use ml_core::{DetectionModel, ModelError, ModelLoader, ModelSource};
use video_ingest::{CameraBackend, CameraDevice, CaptureError};
use vision::PipelineConfig;

#[cfg(feature = "opencv")]
pub fn camera_backend() -> Arc<dyn CameraBackend> {
    Arc::new(video_ingest::OpenCvBackend)
}

#[cfg(not(feature = "opencv"))]
pub fn camera_backend() -> Arc<dyn CameraBackend> {
    Arc::new(UnavailableCamera)
}

#[cfg(feature = "with-tch")]
pub fn model_loader(config: &PipelineConfig) -> Arc<dyn ModelLoader> {
    Arc::new(ml_core::torchscript::TorchScriptLoader {
        use_cpu: config.use_cpu,
        class_names: vision::PPE_CLASS_NAMES
            .iter()
            .map(|name| name.to_string())
            .collect(),
        ..Default::default()
    })
}

#[cfg(not(feature = "with-tch"))]
pub fn model_loader(_config: &PipelineConfig) -> Arc<dyn ModelLoader> {
    Arc::new(UnavailableModel)
}

/// Stands in for a camera backend this build does not include.
#[derive(Debug, Default)]
pub struct UnavailableCamera;

impl CameraBackend for UnavailableCamera {
    fn open_device(&self, _index: i32) -> Result<Box<dyn CameraDevice>, CaptureError> {
        Err(CaptureError::Other(anyhow::anyhow!(
            "camera support not compiled in (enable the `opencv` feature)"
        )))
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

/// Stands in for a model backend this build does not include.
#[derive(Debug, Default)]
pub struct UnavailableModel;

impl ModelLoader for UnavailableModel {
    fn load(&self, source: &ModelSource) -> Result<Box<dyn DetectionModel>, ModelError> {
        Err(ModelError::Load {
            path: source.path.clone(),
            reason: "model support not compiled in (enable the `with-tch` feature)".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_backends_explain_themselves() {
        let err = UnavailableCamera.open_device(0).err().unwrap();
        assert!(err.to_string().contains("opencv"));

        let err = UnavailableModel
            .load(&ModelSource::new("best.pt"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("with-tch"));
    }
}
