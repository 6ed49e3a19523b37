//! Emotion label maps

use std::collections::BTreeMap;

/// Labels used when a classifier carries no label map of its own
const FALLBACK_LABELS: [&str; 7] = ["angry", "disgust", "fear", "happy", "sad", "surprise", "neutral"];

/// FER+ output order
pub const FERPLUS_LABELS: [&str; 8] = [
    "neutral", "happy", "surprise", "sad", "angry", "disgust", "fear", "contempt",
];

/// Mapping from model output index to emotion label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    labels: BTreeMap<usize, String>,
}

impl LabelMap {
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).enumerate().collect(),
        }
    }

    /// The 7-class table used when the model has no id2label map
    pub fn fallback() -> Self {
        Self::from_labels(FALLBACK_LABELS)
    }

    pub fn ferplus() -> Self {
        Self::from_labels(FERPLUS_LABELS)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(&index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl From<BTreeMap<usize, String>> for LabelMap {
    fn from(labels: BTreeMap<usize, String>) -> Self {
        Self { labels }
    }
}
