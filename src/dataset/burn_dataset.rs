//! Burn batch types and batchers
//!
//! - `ImageBatcher` stacks decoded images into `[batch, 3, H, W]` tensors
//! - `FeatureBatcher` stacks precomputed feature vectors into `[batch, F]`

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dataset::image_folder::ImageItem;

/// Inputs and integer class targets of one mini-batch
#[derive(Clone, Debug)]
pub struct ClassificationBatch<B: Backend, const D: usize> {
    pub inputs: Tensor<B, D>,
    /// Class indices, shape `[batch]`
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend, const D: usize> ClassificationBatch<B, D> {
    pub fn new(inputs: Tensor<B, D>, targets: Tensor<B, 1, Int>) -> Self {
        Self { inputs, targets }
    }

    /// Number of samples in the batch
    pub fn len(&self) -> usize {
        self.targets.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn targets_tensor<B: Backend>(labels: Vec<i64>, device: &B::Device) -> Tensor<B, 1, Int> {
    let n = labels.len();
    Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [n]), device)
}

/// Batcher for square RGB images of a fixed side
#[derive(Clone, Debug)]
pub struct ImageBatcher {
    image_size: usize,
}

impl ImageBatcher {
    pub fn new(image_size: usize) -> Self {
        Self { image_size }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ClassificationBatch<B, 4>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ClassificationBatch<B, 4> {
        let batch_size = items.len();
        let side = self.image_size;

        let mut images_data = Vec::with_capacity(batch_size * 3 * side * side);
        let mut labels = Vec::with_capacity(batch_size);
        for item in items {
            images_data.extend(item.image);
            labels.push(item.label as i64);
        }

        let inputs = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, 3, side, side]),
            device,
        );

        ClassificationBatch::new(inputs, targets_tensor(labels, device))
    }
}

/// A flattened feature vector computed by a frozen backbone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureItem {
    pub features: Vec<f32>,
    pub label: usize,
}

/// Batcher for precomputed feature vectors
#[derive(Clone, Debug, Default)]
pub struct FeatureBatcher;

impl<B: Backend> Batcher<B, FeatureItem, ClassificationBatch<B, 2>> for FeatureBatcher {
    fn batch(&self, items: Vec<FeatureItem>, device: &B::Device) -> ClassificationBatch<B, 2> {
        let batch_size = items.len();
        let dim = items.first().map(|item| item.features.len()).unwrap_or(0);

        let mut features = Vec::with_capacity(batch_size * dim);
        let mut labels = Vec::with_capacity(batch_size);
        for item in items {
            features.extend(item.features);
            labels.push(item.label as i64);
        }

        let inputs =
            Tensor::<B, 2>::from_floats(TensorData::new(features, [batch_size, dim]), device);

        ClassificationBatch::new(inputs, targets_tensor(labels, device))
    }
}
