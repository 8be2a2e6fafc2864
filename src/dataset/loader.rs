//! Batch loading
//!
//! [`BatchLoader`] turns a burn `Dataset` and `Batcher` into a restartable
//! sequence of batches. Every call to [`BatchSource::batches`] starts a new
//! epoch; with shuffling enabled the epoch draws its own permutation from a
//! `ChaCha8Rng` seeded with `seed + epoch`, so runs are reproducible.
//!
//! Samples of a batch are decoded in parallel on a dedicated rayon pool when
//! `num_workers > 0`. Batches themselves are produced in order.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::{Dataset, InMemDataset};
use burn::tensor::backend::{AutodiffBackend, Backend};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, info};

use crate::config::{DataConfig, LoaderConfig};
use crate::dataset::burn_dataset::{ClassificationBatch, ImageBatcher};
use crate::dataset::image_folder::{prepare_datasets, ImageItem, ImageTransform};
use crate::utils::error::{Result, TransferError};

/// A dataset whose accessor reports why a sample could not be produced
pub trait TryDataset<I>: Dataset<I> {
    fn try_get(&self, index: usize) -> Result<I> {
        self.get(index)
            .ok_or_else(|| TransferError::Dataset(format!("failed to load sample {}", index)))
    }
}

impl<I: Clone + Send + Sync> TryDataset<I> for InMemDataset<I> {}

/// A restartable, finite sequence of batches
pub trait BatchSource<O> {
    /// Start a new pass; loading failures are yielded as `Err`
    fn batches(&self) -> Box<dyn Iterator<Item = Result<O>> + '_>;

    /// Batches produced by one pass
    fn num_batches(&self) -> usize;
}

/// Pre-built batches, replayed unchanged on every pass
impl<O: Clone> BatchSource<O> for Vec<O> {
    fn batches(&self) -> Box<dyn Iterator<Item = Result<O>> + '_> {
        Box::new(self.iter().cloned().map(Ok))
    }

    fn num_batches(&self) -> usize {
        self.len()
    }
}

/// Batching options of a single loader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    pub num_workers: usize,
    pub seed: u64,
}

impl LoaderOptions {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            num_workers: 0,
            seed: 42,
        }
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Dataset + batcher driven batch iterator
pub struct BatchLoader<B: Backend, I, O> {
    dataset: Arc<dyn TryDataset<I>>,
    batcher: Arc<dyn Batcher<B, I, O>>,
    options: LoaderOptions,
    device: B::Device,
    pool: Option<Arc<ThreadPool>>,
    epoch: AtomicU64,
    _output: PhantomData<fn() -> O>,
}

impl<B, I, O> BatchLoader<B, I, O>
where
    B: Backend,
    I: Send + 'static,
    O: 'static,
{
    pub fn new(
        dataset: Arc<dyn TryDataset<I>>,
        batcher: Arc<dyn Batcher<B, I, O>>,
        options: LoaderOptions,
        device: B::Device,
    ) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(TransferError::Config(
                "batch size must be positive".to_string(),
            ));
        }

        let pool = if options.num_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(options.num_workers)
                .thread_name(|i| format!("loader-worker-{}", i))
                .build()
                .map_err(|e| TransferError::Dataset(format!("Failed to build worker pool: {e}")))?;
            Some(Arc::new(pool))
        } else {
            None
        };

        Ok(Self {
            dataset,
            batcher,
            options,
            device,
            pool,
            epoch: AtomicU64::new(0),
            _output: PhantomData,
        })
    }

    /// Number of samples in the underlying dataset
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Passes started so far
    pub fn epochs_started(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Dataset indices visited in pass `epoch`
    pub fn epoch_order(&self, epoch: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.options.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.options.seed.wrapping_add(epoch));
            order.shuffle(&mut rng);
        }
        order
    }

    fn load_items(&self, indices: &[usize]) -> Result<Vec<I>> {
        let dataset = &self.dataset;
        let fetch = || -> Result<Vec<I>> {
            match &self.pool {
                Some(_) => indices.par_iter().map(|&i| dataset.try_get(i)).collect(),
                None => indices.iter().map(|&i| dataset.try_get(i)).collect(),
            }
        };

        match &self.pool {
            Some(pool) => pool.install(fetch),
            None => fetch(),
        }
    }

    fn load_batch(&self, indices: &[usize]) -> Result<O> {
        let items = self.load_items(indices)?;
        Ok(self.batcher.batch(items, &self.device))
    }
}

impl<B, I, O> BatchSource<O> for BatchLoader<B, I, O>
where
    B: Backend,
    I: Send + 'static,
    O: 'static,
{
    fn batches(&self) -> Box<dyn Iterator<Item = Result<O>> + '_> {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Starting pass {} over {} samples ({} batches)",
            epoch,
            self.len(),
            self.num_batches()
        );

        Box::new(EpochIter {
            loader: self,
            order: self.epoch_order(epoch),
            cursor: 0,
            failed: false,
        })
    }

    fn num_batches(&self) -> usize {
        self.len().div_ceil(self.options.batch_size)
    }
}

struct EpochIter<'a, B: Backend, I, O> {
    loader: &'a BatchLoader<B, I, O>,
    order: Vec<usize>,
    cursor: usize,
    failed: bool,
}

impl<B, I, O> Iterator for EpochIter<'_, B, I, O>
where
    B: Backend,
    I: Send + 'static,
    O: 'static,
{
    type Item = Result<O>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor >= self.order.len() {
            return None;
        }

        let end = (self.cursor + self.loader.options.batch_size).min(self.order.len());
        let batch = self.loader.load_batch(&self.order[self.cursor..end]);
        self.cursor = end;

        if batch.is_err() {
            self.failed = true;
        }
        Some(batch)
    }
}

/// Image loaders for training and validation plus their sizes
///
/// Training batches live on `BT`, validation batches on `BV`.
pub struct SplitLoaders<BT: Backend, BV: Backend> {
    pub train_size: usize,
    pub valid_size: usize,
    pub train: BatchLoader<BT, ImageItem, ClassificationBatch<BT, 4>>,
    pub valid: BatchLoader<BV, ImageItem, ClassificationBatch<BV, 4>>,
    /// Class names, indexed by label
    pub classes: Vec<String>,
    /// Class names of the valid split, normally equal to `classes`
    pub valid_classes: Vec<String>,
}

impl<BT: Backend, BV: Backend> SplitLoaders<BT, BV> {
    /// Number of distinct labels either split can yield
    pub fn num_labels(&self) -> usize {
        self.classes.len().max(self.valid_classes.len())
    }
}

/// Loaders for autodiff training and gradient-free validation
pub type AutodiffSplitLoaders<B> = SplitLoaders<B, <B as AutodiffBackend>::InnerBackend>;

/// Build the train and valid loaders of `data`
///
/// Training batches are produced on the autodiff backend `B`, validation
/// batches on its inner backend.
pub fn split_train_valid_sets<B: AutodiffBackend>(
    loader: &LoaderConfig,
    data: &DataConfig,
    device: &B::Device,
) -> Result<AutodiffSplitLoaders<B>> {
    split_loaders_on::<B, B::InnerBackend>(loader, data, device, device)
}

/// Build the train and valid loaders of `data` on explicit backends
pub fn split_loaders_on<BT: Backend, BV: Backend>(
    loader: &LoaderConfig,
    data: &DataConfig,
    train_device: &BT::Device,
    valid_device: &BV::Device,
) -> Result<SplitLoaders<BT, BV>> {
    let transform = ImageTransform::with_crop(data.crop_size);
    let splits = prepare_datasets(data, transform)?;
    let classes = splits.classes().to_vec();
    let valid_classes = splits.valid.classes().to_vec();

    let train_size = splits.train.len();
    let valid_size = splits.valid.len();
    let batcher = ImageBatcher::new(data.crop_size as usize);

    let train = BatchLoader::new(
        Arc::new(splits.train),
        Arc::new(batcher.clone()),
        LoaderOptions::new(loader.batch_size_train)
            .with_shuffle(loader.shuffle_train)
            .with_num_workers(loader.num_workers)
            .with_seed(loader.seed),
        train_device.clone(),
    )?;

    let valid = BatchLoader::new(
        Arc::new(splits.valid),
        Arc::new(batcher),
        LoaderOptions::new(loader.batch_size_valid)
            .with_shuffle(loader.shuffle_valid)
            .with_num_workers(loader.num_workers)
            .with_seed(loader.seed),
        valid_device.clone(),
    )?;

    info!(
        "Train: {} samples in {} batches | Valid: {} samples in {} batches",
        train_size,
        train.num_batches(),
        valid_size,
        valid.num_batches()
    );

    Ok(SplitLoaders {
        train_size,
        valid_size,
        train,
        valid,
        classes,
        valid_classes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::burn_dataset::{FeatureBatcher, FeatureItem};
    use crate::dataset::image_folder::tests::write_data_dir;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<NdArray>;

    fn feature_loader(
        n: usize,
        options: LoaderOptions,
    ) -> BatchLoader<TestBackend, FeatureItem, ClassificationBatch<TestBackend, 2>> {
        let items: Vec<FeatureItem> = (0..n)
            .map(|i| FeatureItem {
                features: vec![i as f32],
                label: i % 2,
            })
            .collect();
        BatchLoader::new(
            Arc::new(InMemDataset::new(items)),
            Arc::new(FeatureBatcher),
            options,
            Default::default(),
        )
        .unwrap()
    }

    fn pass_values(
        loader: &BatchLoader<TestBackend, FeatureItem, ClassificationBatch<TestBackend, 2>>,
    ) -> Vec<Vec<f32>> {
        loader
            .batches()
            .map(|b| {
                b.unwrap()
                    .inputs
                    .into_data()
                    .convert::<f32>()
                    .to_vec::<f32>()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_batch_count_and_sizes() {
        let loader = feature_loader(23, LoaderOptions::new(10));
        assert_eq!(loader.num_batches(), 3);

        let sizes: Vec<usize> = loader.batches().map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
    }

    #[test]
    fn test_unshuffled_order_is_dataset_order() {
        let loader = feature_loader(5, LoaderOptions::new(2));
        let values: Vec<f32> = pass_values(&loader).concat();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_shuffle_is_seeded_per_epoch() {
        let options = LoaderOptions::new(4).with_shuffle(true).with_seed(7);
        let a = feature_loader(20, options);
        let b = feature_loader(20, options);

        let a_first = pass_values(&a).concat();
        let a_second = pass_values(&a).concat();
        let b_first = pass_values(&b).concat();

        assert_eq!(a_first, b_first);
        assert_ne!(a_first, a_second);
        assert_eq!(a.epochs_started(), 2);

        let mut sorted = a_second.clone();
        sorted.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert_eq!(sorted, (0..20).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_workers_preserve_order() {
        let serial = feature_loader(17, LoaderOptions::new(5));
        let parallel = feature_loader(17, LoaderOptions::new(5).with_num_workers(3));
        assert_eq!(pass_values(&serial), pass_values(&parallel));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let result = BatchLoader::<TestBackend, FeatureItem, ClassificationBatch<TestBackend, 2>>::new(
            Arc::new(InMemDataset::new(Vec::<FeatureItem>::new())),
            Arc::new(FeatureBatcher),
            LoaderOptions::new(0),
            Default::default(),
        );
        assert!(matches!(result, Err(TransferError::Config(_))));
    }

    #[test]
    fn test_split_train_valid_sets() {
        let dir = write_data_dir(&["neg", "pos"], 6, 3, 6);
        let data = DataConfig {
            data_dir: dir.path().to_path_buf(),
            crop_size: 4,
            ..DataConfig::default()
        };
        let loader_config = LoaderConfig {
            batch_size_train: 4,
            batch_size_valid: 5,
            num_workers: 2,
            ..LoaderConfig::default()
        };

        let splits =
            split_train_valid_sets::<TestAutodiffBackend>(&loader_config, &data, &Default::default())
                .unwrap();

        assert_eq!(splits.train_size, 12);
        assert_eq!(splits.valid_size, 6);
        assert_eq!(splits.classes, vec!["neg".to_string(), "pos".to_string()]);

        let train_total: usize = splits.train.batches().map(|b| b.unwrap().len()).sum();
        let valid_batches: Vec<_> = splits.valid.batches().map(|b| b.unwrap()).collect();
        assert_eq!(train_total, splits.train_size);
        assert_eq!(valid_batches.len(), 2);
        assert_eq!(valid_batches[0].inputs.dims(), [5, 3, 4, 4]);
        assert_eq!(
            valid_batches.iter().map(|b| b.len()).sum::<usize>(),
            splits.valid_size
        );
    }

    #[test]
    fn test_unreadable_sample_ends_the_pass() {
        let dir = write_data_dir(&["a", "b"], 2, 1, 4);
        std::fs::write(dir.path().join("train").join("a").join("bad.png"), b"nope").unwrap();
        let data = DataConfig {
            data_dir: dir.path().to_path_buf(),
            crop_size: 4,
            ..DataConfig::default()
        };
        let loader_config = LoaderConfig {
            batch_size_train: 1,
            shuffle_train: false,
            num_workers: 0,
            ..LoaderConfig::default()
        };

        let splits =
            split_train_valid_sets::<TestAutodiffBackend>(&loader_config, &data, &Default::default())
                .unwrap();

        let results: Vec<_> = splits.train.batches().collect();
        // "bad.png" sorts first, so the pass stops after its error
        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(TransferError::ImageLoad(path, _)) => assert!(path.ends_with("a/bad.png")),
            other => panic!("expected an image error, got {:?}", other.as_ref().err()),
        }
    }
}
