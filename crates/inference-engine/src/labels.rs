//! Class label set

use crate::InferenceError;

/// Output units of the classification head
pub const NUM_CLASSES: usize = 12;

/// Label returned for an index outside the label set
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Training-order labels. Must stay index-aligned with the checkpoint.
pub const DEFAULT_LABELS: [&str; NUM_CLASSES] = [
    "Battery",
    "Biological",
    "Brown-glass",
    "Cardboard",
    "Clothes",
    "Green-glass",
    "Metal",
    "Paper",
    "Plastic",
    "Shoes",
    "Trash",
    "White-glass",
];

/// Ordered label set, index-aligned with the model output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLabels {
    labels: Vec<String>,
}

impl ClassLabels {
    /// Build a label set; exactly `NUM_CLASSES` entries are required.
    pub fn new(labels: Vec<String>) -> Result<Self, InferenceError> {
        if labels.len() != NUM_CLASSES {
            return Err(InferenceError::InvalidLabels {
                expected: NUM_CLASSES,
                actual: labels.len(),
            });
        }
        Ok(Self { labels })
    }

    /// Label for a class index, or `"Unknown"` when out of range
    pub fn label_for(&self, class_id: usize) -> &str {
        self.labels
            .get(class_id)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_LABEL)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.labels
    }
}

impl Default for ClassLabels {
    fn default() -> Self {
        Self {
            labels: DEFAULT_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}
