//! Waste Classification Inference Engine
//!
//! Loads a classification checkpoint once (either a complete ONNX graph run
//! by tract, or a PyTorch/safetensors state dictionary loaded into a candle
//! MobileNetV3) and serves single-image predictions from it.

mod classifier;
mod engine;
mod labels;
mod loader;
mod mobilenet;
mod onnx;
mod state_dict;

pub use classifier::ImageClassifier;
pub use engine::{argmax, softmax, InferenceEngine, Prediction};
pub use labels::{ClassLabels, DEFAULT_LABELS, NUM_CLASSES, UNKNOWN_LABEL};
pub use loader::{LoadAttempt, LoadReport, ModelLoader, ModelSource};
pub use mobilenet::{Architecture, MobileNetV3};
pub use onnx::OnnxClassifier;
pub use state_dict::StateDict;

use preprocess::PreprocessError;
use thiserror::Error;

/// Errors while loading or running a model
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Model load failed: {0}")]
    ModelLoadError(String),
    #[error("Inference failed: {0}")]
    InferenceFailed(String),
    #[error("Invalid input shape: expected {expected}, got {actual}")]
    InvalidInputShape { expected: String, actual: String },
    #[error("Error(s) in loading state_dict for {architecture}: {details}")]
    StateDictMismatch {
        architecture: &'static str,
        details: String,
    },
    #[error("Expected {expected} class labels, got {actual}")]
    InvalidLabels { expected: usize, actual: usize },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Errors surfaced to a prediction caller
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("Model not loaded. Please ensure the checkpoint file exists at the configured model path.")]
    ModelNotLoaded,
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}
