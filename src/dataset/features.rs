//! Precomputed backbone features
//!
//! Running a frozen convolutional backbone every epoch is wasted work when
//! only the classifier head trains. [`create_preconvfeat_loader`] runs the
//! backbone once over a source, keeps every flattened activation in memory
//! and serves them through a new [`BatchLoader`].

use std::sync::Arc;

use burn::data::dataset::InMemDataset;
use burn::tensor::backend::Backend;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::dataset::burn_dataset::{ClassificationBatch, FeatureBatcher, FeatureItem};
use crate::dataset::loader::{BatchLoader, BatchSource, LoaderOptions};
use crate::model::FeatureExtractor;
use crate::utils::error::{Result, TransferError};

/// Batching of the loader built over precomputed features
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureLoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
}

impl FeatureLoaderConfig {
    pub fn new(batch_size: usize, shuffle: bool) -> Self {
        Self {
            batch_size,
            shuffle,
            seed: 42,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Loader over in-memory feature vectors
pub type FeatureLoader<B> = BatchLoader<B, FeatureItem, ClassificationBatch<B, 2>>;

/// Run `extractor` over every batch of `source`, in source order
pub fn precompute_features<B, S, E>(source: &S, extractor: &E) -> Result<Vec<FeatureItem>>
where
    B: Backend,
    S: BatchSource<ClassificationBatch<B, 4>> + ?Sized,
    E: FeatureExtractor<B>,
{
    let pb = ProgressBar::new(source.num_batches() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches")
            .map_err(|e| TransferError::Dataset(format!("invalid progress template: {e}")))?
            .progress_chars("#>-"),
    );

    let mut items = Vec::new();
    for batch in source.batches() {
        let batch = batch?;

        let activations = extractor.features(batch.inputs);
        let [n, c, h, w] = activations.dims();
        let values = activations.into_data().convert::<f32>().to_vec::<f32>()?;
        let labels = batch.targets.into_data().convert::<i64>().to_vec::<i64>()?;

        let dim = c * h * w;
        items.extend(
            values
                .chunks(dim.max(1))
                .zip(labels)
                .take(n)
                .map(|(features, label)| FeatureItem {
                    features: features.to_vec(),
                    label: label as usize,
                }),
        );
        pb.inc(1);
    }
    pb.finish_and_clear();

    Ok(items)
}

/// Precompute features of `source` and wrap them in a loader on `device`
///
/// The extractor runs on a backend of its own, normally the inner backend of
/// the one training the head, so no gradients are recorded.
pub fn create_preconvfeat_loader<B, BO, S, E>(
    source: &S,
    extractor: &E,
    config: &FeatureLoaderConfig,
    device: &BO::Device,
) -> Result<FeatureLoader<BO>>
where
    B: Backend,
    BO: Backend,
    S: BatchSource<ClassificationBatch<B, 4>> + ?Sized,
    E: FeatureExtractor<B>,
{
    let items = precompute_features(source, extractor)?;
    let dim = items.first().map(|item| item.features.len()).unwrap_or(0);
    info!("Precomputed {} feature vectors of length {}", items.len(), dim);

    BatchLoader::new(
        Arc::new(InMemDataset::new(items)),
        Arc::new(FeatureBatcher),
        LoaderOptions::new(config.batch_size)
            .with_shuffle(config.shuffle)
            .with_seed(config.seed),
        device.clone(),
    )
}
