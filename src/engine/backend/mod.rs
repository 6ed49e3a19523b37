//! OpenVINO inference backend
//!
//! Provides:
//! - Model lazy loading, warm-up and idle unloading ([`ModelPool`])
//! - SCRFD face localization ([`ScrfdLocator`])
//! - FER+ emotion classification ([`FerPlusClassifier`])

pub mod ferplus;
pub mod pool;
pub mod scrfd;

use std::sync::Arc;

use anyhow::Result;
use openvino::{ElementType, Shape, Tensor};

use crate::config::Config;

use super::{FaceProcessor, LabelMap, ModelResources};

pub use ferplus::FerPlusClassifier;
pub use pool::{ModelPool, ModelType};
pub use scrfd::ScrfdLocator;

/// Wire the pool's models into the pipeline's model resources
pub fn build_resources(pool: Arc<ModelPool>, config: &Config) -> ModelResources {
    let labels = match &config.models.emotion_labels {
        Some(labels) => LabelMap::from_labels(labels.iter().cloned()),
        None => LabelMap::ferplus(),
    };

    let locator = ScrfdLocator::new(pool.clone(), config.detection.confidence_threshold);
    let classifier = FerPlusClassifier::new(pool, labels);

    ModelResources::new(Arc::new(locator), Arc::new(classifier), FaceProcessor::ferplus())
}

/// Copy an f32 buffer into a new OpenVINO tensor of the given shape
fn input_tensor(data: &[f32], dims: &[i64]) -> Result<Tensor> {
    let shape = Shape::new(dims)?;
    let mut tensor = Tensor::new(ElementType::F32, &shape)?;

    let raw = tensor.get_raw_data_mut()?;
    anyhow::ensure!(
        raw.len() == std::mem::size_of_val(data),
        "tensor holds {} bytes, input has {}",
        raw.len(),
        std::mem::size_of_val(data)
    );
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), raw.as_mut_ptr() as *mut f32, data.len());
    }

    Ok(tensor)
}

/// Read tensor data as f32 vector
fn read_tensor_f32(tensor: &Tensor) -> Result<Vec<f32>> {
    let shape = tensor.get_shape()?;
    let total_elements: i64 = shape.get_dimensions().iter().product();

    let raw = tensor.get_raw_data()?;
    anyhow::ensure!(
        raw.len() >= total_elements as usize * std::mem::size_of::<f32>(),
        "output tensor is smaller than its shape"
    );

    let data = unsafe {
        std::slice::from_raw_parts(raw.as_ptr() as *const f32, total_elements as usize).to_vec()
    };
    Ok(data)
}
