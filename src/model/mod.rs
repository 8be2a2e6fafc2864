//! Models
//!
//! The training loops only need two capabilities from a network:
//!
//! - [`Classify`]: map an input batch to class scores `[batch, classes]`
//! - [`FeatureExtractor`]: run the convolutional backbone alone, used to
//!   precompute features for head-only training
//!
//! [`vgg::VggNet`] provides both; its [`vgg::ClassifierHead`] classifies
//! flattened feature vectors.

use burn::tensor::{backend::Backend, Tensor};

pub mod vgg;

pub use vgg::{ClassifierHead, VggConfig, VggNet};

/// Maps a `D`-dimensional input batch to raw class scores
pub trait Classify<B: Backend, const D: usize> {
    fn classify(&self, inputs: Tensor<B, D>) -> Tensor<B, 2>;
}

/// The convolutional part of a network, without its classifier
pub trait FeatureExtractor<B: Backend> {
    fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 4>;
}
