//! Experiment configuration
//!
//! Every knob of a run lives in [`ExperimentConfig`], which can be read from
//! and written to TOML. Missing sections or fields fall back to the defaults
//! below.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, TransferError};

/// Full configuration of a transfer-learning run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub data: DataConfig,
    pub loader: LoaderConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub output: OutputConfig,
}

/// Where the image folders live and how images are cropped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Root directory holding one directory per split
    pub data_dir: PathBuf,
    /// Name of the training split directory
    pub train_split: String,
    /// Name of the validation split directory
    pub valid_split: String,
    /// Side of the square center crop
    pub crop_size: u32,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            train_split: "train".to_string(),
            valid_split: "valid".to_string(),
            crop_size: 224,
        }
    }
}

impl DataConfig {
    pub fn train_dir(&self) -> PathBuf {
        self.data_dir.join(&self.train_split)
    }

    pub fn valid_dir(&self) -> PathBuf {
        self.data_dir.join(&self.valid_split)
    }
}

/// Batching, shuffling and worker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub batch_size_train: usize,
    pub batch_size_valid: usize,
    /// Batch size of the loaders built over precomputed features
    pub batch_size_preconvfeat: usize,
    pub shuffle_train: bool,
    pub shuffle_valid: bool,
    /// Threads loading the samples of a batch; 0 loads on the caller
    pub num_workers: usize,
    /// Base seed of the per-epoch shuffle
    pub seed: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size_train: 64,
            batch_size_valid: 5,
            batch_size_preconvfeat: 128,
            shuffle_train: true,
            shuffle_valid: false,
            num_workers: 6,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub num_classes: usize,
    /// Burn record with pretrained weights, loaded before the head is resized
    pub weights: Option<PathBuf>,
    /// Classes of the pretrained record's head
    pub pretrained_classes: usize,
    /// Stop gradients through the convolutional backbone
    pub freeze_features: bool,
    pub hidden_size: usize,
    pub dropout: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: 2,
            weights: None,
            pretrained_classes: 1000,
            freeze_features: false,
            hidden_size: 4096,
            dropout: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    /// SGD momentum, ignored by Adam
    pub momentum: Option<f64>,
    pub label_smoothing: Option<f32>,
    /// Per-class loss weights, one entry per class
    pub class_weights: Option<Vec<f32>>,
    /// Label counted as positive for recall
    pub positive_class: usize,
    /// Train the head on precomputed backbone features
    pub precompute: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 5,
            learning_rate: 0.01,
            optimizer: OptimizerKind::Sgd,
            momentum: Some(0.9),
            label_smoothing: None,
            class_weights: None,
            positive_class: 1,
            precompute: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Sgd => write!(f, "sgd"),
            OptimizerKind::Adam => write!(f, "adam"),
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            other => Err(TransferError::Config(format!(
                "unknown optimizer '{}', expected sgd or adam",
                other
            ))),
        }
    }
}

/// Where run artifacts are written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub output_dir: PathBuf,
    pub save_model: bool,
    pub save_chart: bool,
    pub save_predictions: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            save_model: true,
            save_chart: true,
            save_predictions: true,
        }
    }
}

impl OutputConfig {
    /// Record path without extension; the recorder appends its own
    pub fn model_path(&self) -> PathBuf {
        self.output_dir.join("model")
    }

    pub fn chart_path(&self) -> PathBuf {
        self.output_dir.join("training_history.svg")
    }

    pub fn predictions_path(&self) -> PathBuf {
        self.output_dir.join("validation.json")
    }

    pub fn history_path(&self) -> PathBuf {
        self.output_dir.join("history.json")
    }
}

impl ExperimentConfig {
    /// Read a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        load_toml_config(path)
    }

    /// Write as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject settings no run can succeed with
    pub fn validate(&self) -> Result<()> {
        let loader = &self.loader;
        for (name, value) in [
            ("batch_size_train", loader.batch_size_train),
            ("batch_size_valid", loader.batch_size_valid),
            ("batch_size_preconvfeat", loader.batch_size_preconvfeat),
        ] {
            if value == 0 {
                return Err(TransferError::Config(format!("{} must be positive", name)));
            }
        }

        if self.data.crop_size == 0 {
            return Err(TransferError::Config("crop_size must be positive".into()));
        }
        if self.training.epochs == 0 {
            return Err(TransferError::Config("epochs must be positive".into()));
        }
        if !(self.training.learning_rate > 0.0) {
            return Err(TransferError::Config(format!(
                "learning_rate must be positive, got {}",
                self.training.learning_rate
            )));
        }
        if self.model.num_classes < 2 {
            return Err(TransferError::Config(
                "num_classes must be at least 2".into(),
            ));
        }
        if self.training.positive_class >= self.model.num_classes {
            return Err(TransferError::Config(format!(
                "positive_class {} out of range for {} classes",
                self.training.positive_class, self.model.num_classes
            )));
        }
        if let Some(smoothing) = self.training.label_smoothing {
            if !(0.0..=1.0).contains(&smoothing) {
                return Err(TransferError::Config(format!(
                    "label_smoothing must lie in [0, 1], got {}",
                    smoothing
                )));
            }
        }
        if let Some(weights) = &self.training.class_weights {
            if weights.len() != self.model.num_classes {
                return Err(TransferError::Config(format!(
                    "class_weights has {} entries for {} classes",
                    weights.len(),
                    self.model.num_classes
                )));
            }
        }

        Ok(())
    }
}

/// Deserialize any TOML file into `T`
pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path).map_err(|e| {
        TransferError::Config(format!("Failed to read config {}: {e}", path.display()))
    })?;

    toml::from_str(&content).map_err(|e| {
        TransferError::Config(format!("Failed to parse config {}: {e}", path.display()))
    })
}
