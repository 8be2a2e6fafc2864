//! Training and validation loops
//!
//! - [`trainer::Trainer`]: epochs of forward, loss, backward and optimizer
//!   step, accumulating loss, accuracy and recall
//! - [`validator::Validator`]: one gradient-free pass collecting predictions,
//!   raw scores and labels
//! - [`pipeline`]: split, train, validate
//! - [`criterion`]: loss functions

use burn::tensor::{backend::Backend, Int, Tensor};

use crate::utils::error::Result;

pub mod criterion;
pub mod pipeline;
pub mod trainer;
pub mod validator;

pub use criterion::{CrossEntropy, Criterion};
pub use pipeline::{
    build_model, build_optimizer, run_experiment, run_pipeline, run_precomputed_pipeline,
    OptimizerChoice, PipelineOutcome,
};
pub use trainer::{Trainer, TrainerConfig};
pub use validator::{ValidationOutput, Validator, ValidatorConfig};

/// Arg-max predictions and targets of a batch, on the host
pub(crate) fn host_predictions<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Result<(Vec<usize>, Vec<usize>)> {
    let predictions = logits
        .argmax(1)
        .flatten::<1>(0, 1)
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()?;
    let targets = targets.into_data().convert::<i64>().to_vec::<i64>()?;

    Ok((
        predictions.into_iter().map(|p| p as usize).collect(),
        targets.into_iter().map(|t| t as usize).collect(),
    ))
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::cell::Cell;

    use burn::tensor::{backend::Backend, Int, Tensor, TensorData};

    use crate::dataset::{BatchSource, ClassificationBatch};
    use crate::utils::error::Result;

    /// Feature batches whose first feature encodes the label
    ///
    /// Samples alternate between class 0 and 1.
    pub(crate) fn separable_batches<B: Backend>(
        samples: usize,
        batch_size: usize,
        dim: usize,
        device: &B::Device,
    ) -> Vec<ClassificationBatch<B, 2>> {
        (0..samples)
            .collect::<Vec<_>>()
            .chunks(batch_size)
            .map(|chunk| {
                let mut features = Vec::with_capacity(chunk.len() * dim);
                let mut labels = Vec::with_capacity(chunk.len());
                for &i in chunk {
                    let label = i % 2;
                    let sign = if label == 1 { 1.0 } else { -1.0 };
                    features.extend((0..dim).map(|d| if d == 0 { sign } else { 0.1 * d as f32 }));
                    labels.push(label as i64);
                }
                let n = chunk.len();
                ClassificationBatch::new(
                    Tensor::<B, 2>::from_floats(TensorData::new(features, [n, dim]), device),
                    Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [n]), device),
                )
            })
            .collect()
    }

    /// Counts batches handed out across all passes
    pub(crate) struct CountingSource<O> {
        pub inner: Vec<O>,
        pub served: Cell<usize>,
    }

    impl<O> CountingSource<O> {
        pub fn new(inner: Vec<O>) -> Self {
            Self {
                inner,
                served: Cell::new(0),
            }
        }
    }

    impl<O: Clone> BatchSource<O> for CountingSource<O> {
        fn batches(&self) -> Box<dyn Iterator<Item = Result<O>> + '_> {
            Box::new(self.inner.iter().cloned().map(move |b| {
                self.served.set(self.served.get() + 1);
                Ok(b)
            }))
        }

        fn num_batches(&self) -> usize {
            self.inner.len()
        }
    }
}
