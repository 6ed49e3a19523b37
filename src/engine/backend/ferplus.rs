//! FER+ Emotion Classifier
//!
//! Runs the ONNX FER+ model one face at a time on 64x64 grayscale input.

use std::sync::Arc;

use anyhow::{Context, Result};
use ndarray::{Array4, Axis};
use tracing::debug;

use crate::engine::{EmotionClassifier, LabelMap};
use crate::utils::math::{is_distribution, softmax};

use super::pool::{ModelPool, ModelType};
use super::{input_tensor, read_tensor_f32};

pub struct FerPlusClassifier {
    pool: Arc<ModelPool>,
    labels: LabelMap,
}

impl FerPlusClassifier {
    pub fn new(pool: Arc<ModelPool>, labels: LabelMap) -> Self {
        Self { pool, labels }
    }
}

impl EmotionClassifier for FerPlusClassifier {
    fn labels(&self) -> Option<&LabelMap> {
        Some(&self.labels)
    }

    fn classify(&self, batch: &Array4<f32>) -> Result<Vec<Vec<f32>>> {
        let (_, channels, height, width) = batch.dim();
        let model = self.pool.get_model(ModelType::Emotion)?;

        let mut distributions = Vec::with_capacity(batch.len_of(Axis(0)));
        for face in batch.axis_iter(Axis(0)) {
            let data = face.as_standard_layout();
            let data = data.as_slice().context("face tensor is not contiguous")?;

            let mut request = model.create_infer_request()?;
            let input = input_tensor(data, &[1, channels as i64, height as i64, width as i64])?;
            request.set_input_tensor(&input)?;
            request.infer().context("FER+ inference failed")?;

            let output = read_tensor_f32(&request.get_output_tensor()?)?;
            let probs = if is_distribution(&output) {
                output
            } else {
                softmax(&output)
            };
            distributions.push(probs);
        }

        debug!("Classified {} face(s)", distributions.len());
        Ok(distributions)
    }
}
