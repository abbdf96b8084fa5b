//! Startup checkpoint resolution
//!
//! A checkpoint may hold a complete model graph or a bare state dictionary.
//! Resolution tries the complete graph first, then each candidate
//! architecture in order; the first success wins. Nothing here fails the
//! process: every error ends up in the [`LoadReport`] and the log.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::Device;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::classifier::ImageClassifier;
use crate::labels::NUM_CLASSES;
use crate::mobilenet::Architecture;
use crate::onnx::OnnxClassifier;
use crate::state_dict::StateDict;

/// How a model was (or would have been) obtained from a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModelSource {
    /// Complete graph, architecture included
    FullGraph,
    /// State dictionary loaded into a known architecture
    StateDict(Architecture),
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::FullGraph => f.write_str("full model graph"),
            ModelSource::StateDict(arch) => write!(f, "{} state dictionary", arch),
        }
    }
}

/// A failed loading attempt
#[derive(Debug, Clone, Serialize)]
pub struct LoadAttempt {
    pub source: ModelSource,
    pub error: String,
}

/// Outcome of resolving a checkpoint
pub struct LoadReport {
    pub checkpoint: PathBuf,
    pub model: Option<Arc<dyn ImageClassifier>>,
    pub source: Option<ModelSource>,
    /// Failed attempts, in the order they were tried
    pub attempts: Vec<LoadAttempt>,
}

impl LoadReport {
    fn new(checkpoint: &Path) -> Self {
        Self {
            checkpoint: checkpoint.to_path_buf(),
            model: None,
            source: None,
            attempts: Vec::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Whether a given path was tried and rejected
    pub fn attempted(&self, source: ModelSource) -> bool {
        self.attempts.iter().any(|a| a.source == source)
    }

    fn succeed(&mut self, source: ModelSource, model: Arc<dyn ImageClassifier>) {
        info!(
            "Model loaded as {} from {}",
            source,
            self.checkpoint.display()
        );
        self.source = Some(source);
        self.model = Some(model);
    }

    fn fail(&mut self, source: ModelSource, error: impl ToString) {
        let error = error.to_string();
        warn!("Not a {}: {}", source, error);
        self.attempts.push(LoadAttempt { source, error });
    }
}

impl fmt::Debug for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadReport")
            .field("checkpoint", &self.checkpoint)
            .field("model", &self.model.as_ref().map(|m| m.name()))
            .field("source", &self.source)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Resolves a checkpoint into a ready model
#[derive(Debug, Clone)]
pub struct ModelLoader {
    num_classes: usize,
    architectures: Vec<Architecture>,
    device: Device,
}

impl Default for ModelLoader {
    fn default() -> Self {
        Self {
            num_classes: NUM_CLASSES,
            architectures: Architecture::CANDIDATES.to_vec(),
            device: Device::Cpu,
        }
    }
}

impl ModelLoader {
    pub fn new(num_classes: usize, architectures: Vec<Architecture>) -> Self {
        Self {
            num_classes,
            architectures,
            ..Default::default()
        }
    }

    pub fn architectures(&self) -> &[Architecture] {
        &self.architectures
    }

    /// Resolve `path`. Never panics and never returns an error: a failure
    /// leaves `model` unset in the report.
    pub fn load(&self, path: &Path) -> LoadReport {
        let mut report = LoadReport::new(path);

        if !path.exists() {
            warn!(
                "Model file not found at {}. Prediction endpoint will fail.",
                path.display()
            );
            return report;
        }

        match OnnxClassifier::load(path) {
            Ok(model) => {
                report.succeed(ModelSource::FullGraph, Arc::new(model));
                return report;
            }
            Err(e) => report.fail(ModelSource::FullGraph, e),
        }

        info!("Model is likely a state_dict. Attempting to load into architecture...");
        let state_dict = match StateDict::read(path) {
            Ok(dict) => dict,
            Err(e) => {
                error!("Failed to read state_dict from {}: {}", path.display(), e);
                for arch in &self.architectures {
                    report.fail(ModelSource::StateDict(*arch), &e);
                }
                return report;
            }
        };

        for arch in &self.architectures {
            let source = ModelSource::StateDict(*arch);
            match state_dict.load_into(*arch, self.num_classes, &self.device) {
                Ok(model) => {
                    report.succeed(source, Arc::new(model));
                    return report;
                }
                Err(e) => report.fail(source, e),
            }
        }

        let tried: Vec<&str> = self.architectures.iter().map(|a| a.as_str()).collect();
        error!(
            "Failed to load model: could not load state_dict into {}",
            tried.join(" or ")
        );
        report
    }
}
