//! Prediction Service

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classifier::ImageClassifier;
use crate::labels::ClassLabels;
use crate::loader::LoadReport;
use crate::{InferenceError, PredictError};

/// Prediction result for one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Predicted waste category
    #[serde(rename = "class")]
    pub label: String,
    /// Index into the label set
    pub class_id: usize,
    /// Probability of the predicted class (0.0 to 1.0)
    pub confidence: f32,
}

/// Shared, read-only prediction engine
///
/// Cheap to clone; every clone refers to the same loaded model.
#[derive(Clone)]
pub struct InferenceEngine {
    model: Option<Arc<dyn ImageClassifier>>,
    labels: ClassLabels,
}

impl InferenceEngine {
    pub fn new(model: Option<Arc<dyn ImageClassifier>>, labels: ClassLabels) -> Self {
        Self { model, labels }
    }

    /// Engine over whatever the loader produced
    pub fn from_report(report: LoadReport, labels: ClassLabels) -> Self {
        Self::new(report.model, labels)
    }

    /// Engine without a model; every prediction fails
    pub fn unloaded(labels: ClassLabels) -> Self {
        Self::new(None, labels)
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model.as_deref().map(|m| m.name())
    }

    pub fn labels(&self) -> &ClassLabels {
        &self.labels
    }

    /// Classify raw uploaded image bytes
    pub fn predict(&self, image_bytes: &[u8]) -> Result<Prediction, PredictError> {
        let model = self.model.as_ref().ok_or(PredictError::ModelNotLoaded)?;
        let start = Instant::now();

        let input = preprocess::preprocess(image_bytes)?;
        let logits = model.logits(&input)?;

        if logits.iter().any(|x| !x.is_finite()) {
            let reason = "model produced non-finite logits".to_string();
            return Err(InferenceError::InferenceFailed(reason).into());
        }

        let probabilities = softmax(&logits);
        let (class_id, confidence) = argmax(&probabilities)
            .ok_or_else(|| InferenceError::InferenceFailed("model produced no logits".into()))?;

        let prediction = Prediction {
            label: self.labels.label_for(class_id).to_string(),
            class_id,
            confidence,
        };

        debug!(
            "Prediction: {} (id={}, conf={:.3}) in {}ms",
            prediction.label,
            prediction.class_id,
            prediction.confidence,
            start.elapsed().as_millis()
        );

        Ok(prediction)
    }
}

/// Numerically stable softmax
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index and value of the largest element; the first one wins on ties
pub fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
}
