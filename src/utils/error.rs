//! Error Handling Module
//!
//! Defines the error type shared by every stage of the transfer-learning
//! pipeline. Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for transfer classifier operations
#[derive(Error, Debug)]
pub enum TransferError {
    /// Error loading or decoding an image
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// Error with dataset operations
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// A split directory exists but contains no usable images
    #[error("No images found under '{0}'")]
    EmptyDataset(PathBuf),

    /// The number of samples consumed differs from the declared dataset size
    #[error("Size mismatch: expected {expected} samples, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Model output does not have the expected shape
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Error converting tensor data to host memory
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error loading or saving a model record
    #[error("Model record error: {0}")]
    Record(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Convenience Result type for transfer classifier operations
pub type Result<T> = std::result::Result<T, TransferError>;

impl From<image::ImageError> for TransferError {
    fn from(err: image::ImageError) -> Self {
        TransferError::ImageLoad(PathBuf::new(), err.to_string())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for TransferError {
    fn from(err: toml::de::Error) -> Self {
        TransferError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for TransferError {
    fn from(err: toml::ser::Error) -> Self {
        TransferError::Serialization(err.to_string())
    }
}

impl From<burn::record::RecorderError> for TransferError {
    fn from(err: burn::record::RecorderError) -> Self {
        TransferError::Record(format!("{:?}", err))
    }
}

impl From<burn::tensor::DataError> for TransferError {
    fn from(err: burn::tensor::DataError) -> Self {
        TransferError::Tensor(format!("{:?}", err))
    }
}
