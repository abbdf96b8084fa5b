//! Parameter-name to tensor mappings read from checkpoint files

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::debug;

use crate::mobilenet::{Architecture, MobileNetV3};
use crate::InferenceError;

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// Keys a training script commonly nests the weights under
const NESTED_KEYS: [Option<&str>; 3] = [None, Some("state_dict"), Some("model_state_dict")];

/// BatchNorm bookkeeping buffer present in PyTorch checkpoints but unused at inference
const IGNORED_SUFFIX: &str = "num_batches_tracked";

/// Names listed per category in a mismatch report
const REPORT_LIMIT: usize = 5;

/// A state dictionary: parameter name -> tensor
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    tensors: HashMap<String, Tensor>,
}

impl StateDict {
    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    /// Read a PyTorch zip checkpoint or a safetensors file.
    pub fn read(path: &Path) -> Result<Self, InferenceError> {
        let mut magic = [0u8; 4];
        let is_zip = File::open(path)
            .and_then(|mut f| f.read_exact(&mut magic))
            .map(|_| magic == ZIP_MAGIC)
            .map_err(|e| InferenceError::ModelLoadError(format!("{}: {}", path.display(), e)))?;

        let dict = if is_zip {
            Self::read_pth(path)?
        } else {
            Self::from_tensors(candle_core::safetensors::load(path, &Device::Cpu)?)
        };

        debug!("Read {} tensors from {}", dict.len(), path.display());
        Ok(dict)
    }

    fn read_pth(path: &Path) -> Result<Self, InferenceError> {
        let mut last_error = None;
        for key in NESTED_KEYS {
            match candle_core::pickle::read_all_with_key(path, key) {
                Ok(tensors) if !tensors.is_empty() => {
                    if let Some(key) = key {
                        debug!("Using weights nested under '{}'", key);
                    }
                    return Ok(Self::from_tensors(tensors.into_iter().collect()));
                }
                Ok(_) => {}
                Err(e) => last_error = Some(e.to_string()),
            }
        }

        Err(InferenceError::ModelLoadError(match last_error {
            Some(e) => format!("no tensors found in {}: {}", path.display(), e),
            None => format!("no tensors found in {}", path.display()),
        }))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Strictly load into `architecture`: every expected parameter must be
    /// present with an identical shape and no unknown parameter may remain.
    pub fn load_into(
        &self,
        architecture: Architecture,
        num_classes: usize,
        device: &Device,
    ) -> Result<MobileNetV3, InferenceError> {
        let expected = expected_parameters(architecture, num_classes)?;
        self.check_against(architecture, &expected)?;

        let vb = VarBuilder::from_tensors(self.tensors.clone(), DType::F32, device);
        Ok(MobileNetV3::new(architecture, num_classes, vb)?)
    }

    fn check_against(
        &self,
        architecture: Architecture,
        expected: &HashMap<String, Shape>,
    ) -> Result<(), InferenceError> {
        let missing: BTreeSet<&str> = expected
            .keys()
            .filter(|name| !self.tensors.contains_key(*name))
            .map(String::as_str)
            .collect();

        let unexpected: BTreeSet<&str> = self
            .tensors
            .keys()
            .filter(|name| !expected.contains_key(*name) && !name.ends_with(IGNORED_SUFFIX))
            .map(String::as_str)
            .collect();

        let mut mismatched: Vec<String> = expected
            .iter()
            .filter_map(|(name, shape)| {
                let tensor = self.tensors.get(name)?;
                (tensor.shape() != shape).then(|| {
                    format!(
                        "size mismatch for {}: checkpoint {:?}, model {:?}",
                        name,
                        tensor.dims(),
                        shape.dims()
                    )
                })
            })
            .collect();
        mismatched.sort();

        if missing.is_empty() && unexpected.is_empty() && mismatched.is_empty() {
            return Ok(());
        }

        let mut details = Vec::new();
        if !missing.is_empty() {
            details.push(format!(
                "{} missing key(s) {}",
                missing.len(),
                summarize(missing.iter())
            ));
        }
        if !unexpected.is_empty() {
            details.push(format!(
                "{} unexpected key(s) {}",
                unexpected.len(),
                summarize(unexpected.iter())
            ));
        }
        if !mismatched.is_empty() {
            details.push(summarize(mismatched.iter()));
        }

        Err(InferenceError::StateDictMismatch {
            architecture: architecture.as_str(),
            details: details.join("; "),
        })
    }
}

fn summarize<T: AsRef<str>>(items: impl ExactSizeIterator<Item = T>) -> String {
    let total = items.len();
    let mut shown: Vec<String> = items
        .take(REPORT_LIMIT)
        .map(|s| s.as_ref().to_string())
        .collect();
    if total > REPORT_LIMIT {
        shown.push(format!("... {} more", total - REPORT_LIMIT));
    }
    format!("[{}]", shown.join(", "))
}

/// Names and shapes an architecture pulls from its var builder
pub(crate) fn expected_parameters(
    architecture: Architecture,
    num_classes: usize,
) -> Result<HashMap<String, Shape>, InferenceError> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    MobileNetV3::new(architecture, num_classes, vb)?;

    let data = varmap
        .data()
        .lock()
        .map_err(|e| InferenceError::ModelLoadError(e.to_string()))?;
    Ok(data
        .iter()
        .map(|(name, var)| (name.clone(), var.shape().clone()))
        .collect())
}
