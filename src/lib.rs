//! # Transfer Classifier
//!
//! Fine-tunes a pretrained VGG-style convolutional network on an image
//! dataset laid out as one directory per class, using the Burn framework.
//!
//! ## Modules
//!
//! - `dataset`: image folders, batchers, the train/valid loaders and
//!   precomputed-feature loaders
//! - `model`: the VGG network and its classifier head
//! - `training`: trainer, validator and the pipelines tying them together
//! - `config`: TOML experiment configuration
//! - `utils`: errors, logging, metrics and charts
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use transfer_classifier::backend::{default_device, TrainingBackend};
//! use transfer_classifier::config::ExperimentConfig;
//! use transfer_classifier::model::VggConfig;
//! use transfer_classifier::training::{build_model, run_experiment};
//!
//! let config = ExperimentConfig::default();
//! let device = default_device();
//! let model = build_model::<TrainingBackend>(VggConfig::vgg16(), &config.model, &device)?;
//! let outcome = run_experiment(&config, model, &device)?;
//! println!("{}", outcome.validation.stats);
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod model;
pub mod training;
pub mod utils;

pub use config::ExperimentConfig;
pub use dataset::{ClassificationBatch, ImageFolderDataset, SplitLoaders};
pub use model::{ClassifierHead, VggConfig, VggNet};
pub use training::{PipelineOutcome, Trainer, ValidationOutput, Validator};
pub use utils::error::{Result, TransferError};
pub use utils::metrics::{EpochStats, TrainingHistory};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
