//! TorchScript detector backend for YOLOv8-style exports.

use std::convert::TryFrom;

use image::{ImageBuffer, Rgb, imageops::FilterType};
use tch::{self, Device, Kind, Tensor};
use tracing::info;

use crate::{
    model::{
        DetectionModel, FrameView, ModelError, ModelLoader, ModelSource, RawDetection, Thresholds,
        verify_source,
    },
    nms::{classwise_nms, decode_rows},
};

const MAX_DETECTIONS: usize = 300;

/// Loads TorchScript modules on the CPU or the first CUDA device.
#[derive(Clone, Debug)]
pub struct TorchScriptLoader {
    pub use_cpu: bool,
    pub input_size: (i64, i64),
    /// Class names indexed by class id; TorchScript exports do not carry them.
    pub class_names: Vec<String>,
}

impl Default for TorchScriptLoader {
    fn default() -> Self {
        Self {
            use_cpu: false,
            input_size: (640, 640),
            class_names: Vec::new(),
        }
    }
}

impl ModelLoader for TorchScriptLoader {
    fn load(&self, source: &ModelSource) -> Result<Box<dyn DetectionModel>, ModelError> {
        verify_source(source)?;
        let device = if self.use_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available()
        };
        let mut module =
            tch::CModule::load_on_device(&source.path, device).map_err(|err| ModelError::Load {
                path: source.path.clone(),
                reason: err.to_string(),
            })?;
        module.set_eval();
        info!(path = %source.path.display(), ?device, "TorchScript model loaded");
        Ok(Box::new(TorchScriptModel {
            module,
            device,
            input_size: self.input_size,
            class_names: self.class_names.clone(),
        }))
    }
}

/// TorchScript-backed detector producing `[1, 4 + classes, N]` predictions.
pub struct TorchScriptModel {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    class_names: Vec<String>,
}

impl TorchScriptModel {
    /// Resize a BGR frame to the model input and build a normalised NCHW tensor.
    fn bgr_to_tensor(&self, frame: FrameView<'_>) -> Result<Tensor, ModelError> {
        let mut rgb = Vec::with_capacity(frame.bgr.len());
        for chunk in frame.bgr.chunks_exact(3) {
            rgb.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
        }
        let image = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(frame.width, frame.height, rgb)
            .ok_or_else(|| ModelError::InvalidInput("frame does not match its geometry".into()))?;

        let (in_w, in_h) = self.input_size;
        let resized = image::imageops::resize(&image, in_w as u32, in_h as u32, FilterType::Triangle);

        let tensor = Tensor::from_slice(resized.as_raw())
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h, in_w, 3])
            .permute([0, 3, 1, 2])
            / 255.0;
        Ok(tensor)
    }
}

impl DetectionModel for TorchScriptModel {
    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn infer(
        &mut self,
        frame: FrameView<'_>,
        thresholds: Thresholds,
    ) -> Result<Vec<RawDetection>, ModelError> {
        let input = self.bgr_to_tensor(frame)?;
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))
            .map_err(|err| ModelError::Inference(err.to_string()))?;

        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(ModelError::Inference(format!(
                "unexpected detector output shape: {shape:?}"
            )));
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> =
            Vec::<Vec<f32>>::try_from(&preds).map_err(|err| ModelError::Inference(err.to_string()))?;

        let (in_w, in_h) = self.input_size;
        let scale_x = frame.width as f32 / in_w as f32;
        let scale_y = frame.height as f32 / in_h as f32;
        let candidates = decode_rows(&rows, thresholds.confidence, (scale_x, scale_y));
        Ok(classwise_nms(candidates, thresholds.iou, MAX_DETECTIONS))
    }
}
