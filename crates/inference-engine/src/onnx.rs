//! Complete model graphs executed with tract

use std::path::Path;

use ndarray::Array4;
use preprocess::INPUT_SHAPE;
use tract_onnx::prelude::*;
use tracing::debug;

use crate::classifier::{check_input_shape, ImageClassifier};
use crate::InferenceError;

/// A self-describing checkpoint: architecture and weights in one ONNX graph
pub struct OnnxClassifier {
    name: String,
    plan: TypedRunnableModel<TypedModel>,
}

impl OnnxClassifier {
    /// Parse, type-check against a `[1, 3, 224, 224]` input and optimize.
    pub fn load(path: &Path) -> Result<Self, InferenceError> {
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|model| {
                model.with_input_fact(
                    0,
                    InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, 224, 224)),
                )
            })
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|e| InferenceError::ModelLoadError(format!("{:#}", e)))?;

        debug!("ONNX graph from {} is runnable", path.display());

        Ok(Self {
            name: format!("ONNX graph ({})", path.display()),
            plan,
        })
    }
}

impl ImageClassifier for OnnxClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn logits(&self, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        check_input_shape(input)?;

        let data: Vec<f32> = input.iter().copied().collect();
        let tensor = Tensor::from_shape(&INPUT_SHAPE, &data)
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        let outputs = self
            .plan
            .run(tvec!(tensor.into()))
            .map_err(|e| InferenceError::InferenceFailed(format!("{:#}", e)))?;

        let first = outputs
            .first()
            .ok_or_else(|| InferenceError::InferenceFailed("Model produced no outputs".into()))?;
        let view = first
            .to_array_view::<f32>()
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        Ok(view.iter().copied().collect())
    }
}
