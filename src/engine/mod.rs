//! Inference engine module
//!
//! Defines the collaborator seams used by the detection pipeline:
//! - Face localization ([`FaceLocator`])
//! - Emotion classification ([`EmotionClassifier`])
//! - Face preprocessing ([`FaceProcessor`])
//!
//! The concrete OpenVINO backend lives in [`backend`] behind the `openvino` feature.

pub mod labels;
pub mod preprocess;
pub mod ranking;

#[cfg(feature = "openvino")]
pub mod backend;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;
use ndarray::Array4;

use crate::service::types::FaceBox;

pub use labels::LabelMap;
pub use preprocess::FaceProcessor;

/// Locates faces in a decoded RGB image
///
/// An empty result is a valid answer, not an error.
pub trait FaceLocator: Send + Sync {
    fn locate(&self, image: &RgbImage) -> Result<Vec<FaceBox>>;
}

/// Classifies a batch of preprocessed faces into emotion probabilities
pub trait EmotionClassifier: Send + Sync {
    /// The model's own index → label map, if it carries one
    fn labels(&self) -> Option<&LabelMap>;

    /// One softmax distribution per face in the NCHW batch, index-aligned with the label map
    fn classify(&self, batch: &Array4<f32>) -> Result<Vec<Vec<f32>>>;
}

/// Reports which models are currently resident, for health checks
pub trait ModelStatus: Send + Sync {
    fn loaded_models(&self) -> HashMap<String, bool>;
}

/// Shared, read-only handle to the models used by every pipeline run
///
/// Built once at startup and passed around behind an `Arc`.
pub struct ModelResources {
    locator: Arc<dyn FaceLocator>,
    classifier: Arc<dyn EmotionClassifier>,
    processor: FaceProcessor,
}

impl ModelResources {
    pub fn new(
        locator: Arc<dyn FaceLocator>,
        classifier: Arc<dyn EmotionClassifier>,
        processor: FaceProcessor,
    ) -> Self {
        Self {
            locator,
            classifier,
            processor,
        }
    }

    pub fn locator(&self) -> &dyn FaceLocator {
        self.locator.as_ref()
    }

    /// Processor and classifier for one batched classification call
    pub fn get_model_and_processor(&self) -> (&FaceProcessor, &dyn EmotionClassifier) {
        (&self.processor, self.classifier.as_ref())
    }
}
