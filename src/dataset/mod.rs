//! Data loading
//!
//! - `image_folder`: directory-per-class datasets with the VGG transform
//! - `burn_dataset`: batch types and burn batchers
//! - `loader`: batch iterators and the train/valid splitter
//! - `features`: loaders over precomputed backbone features

pub mod burn_dataset;
pub mod features;
pub mod image_folder;
pub mod loader;

pub use burn_dataset::{ClassificationBatch, FeatureBatcher, FeatureItem, ImageBatcher};
pub use features::{create_preconvfeat_loader, precompute_features, FeatureLoader, FeatureLoaderConfig};
pub use image_folder::{prepare_datasets, DatasetSplits, ImageFolderDataset, ImageItem, ImageTransform};
pub use loader::{
    split_loaders_on, split_train_valid_sets, AutodiffSplitLoaders, BatchLoader, BatchSource,
    LoaderOptions, SplitLoaders, TryDataset,
};
