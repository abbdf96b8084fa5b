//! Backend-agnostic classifier interface

use ndarray::Array4;
use preprocess::INPUT_SHAPE;

use crate::InferenceError;

/// A loaded, inference-only image classification network.
///
/// Implementations are immutable after construction and shared between
/// concurrent requests.
pub trait ImageClassifier: Send + Sync {
    /// Human readable description of what was loaded
    fn name(&self) -> &str;

    /// Raw logits for a single `[1, 3, 224, 224]` input
    fn logits(&self, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError>;
}

pub(crate) fn check_input_shape(input: &Array4<f32>) -> Result<(), InferenceError> {
    if input.shape() != INPUT_SHAPE {
        return Err(InferenceError::InvalidInputShape {
            expected: format!("{:?}", INPUT_SHAPE),
            actual: format!("{:?}", input.shape()),
        });
    }
    Ok(())
}
