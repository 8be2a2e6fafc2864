//! Loss criteria
//!
//! The trainer and validator are generic over a [`Criterion`] so callers pick
//! the loss the same way they pick the optimizer.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::tensor::{backend::Backend, Int, Tensor};

use crate::config::TrainingConfig;

/// Batch-mean loss of raw class scores against integer targets
pub trait Criterion {
    fn loss<B: Backend>(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1>;
}

/// Cross-entropy over logits, optionally label-smoothed or class-weighted
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrossEntropy {
    pub smoothing: Option<f32>,
    pub class_weights: Option<Vec<f32>>,
}

impl CrossEntropy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_smoothing(mut self, smoothing: Option<f32>) -> Self {
        self.smoothing = smoothing;
        self
    }

    pub fn with_class_weights(mut self, class_weights: Option<Vec<f32>>) -> Self {
        self.class_weights = class_weights;
        self
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new()
            .with_smoothing(config.label_smoothing)
            .with_class_weights(config.class_weights.clone())
    }
}

impl Criterion for CrossEntropy {
    fn loss<B: Backend>(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        CrossEntropyLossConfig::new()
            .with_smoothing(self.smoothing)
            .with_weights(self.class_weights.clone())
            .init(&logits.device())
            .forward(logits, targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{ElementConversion, TensorData};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn loss_of(criterion: &CrossEntropy, logits: Vec<f32>, targets: Vec<i64>) -> f64 {
        let device = Default::default();
        let n = targets.len();
        let logits = Tensor::<TestBackend, 2>::from_floats(TensorData::new(logits, [n, 2]), &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(targets, [n]), &device);
        criterion.loss(logits, targets).into_scalar().elem::<f64>()
    }

    #[test]
    fn test_uniform_logits_give_ln2() {
        let loss = loss_of(&CrossEntropy::new(), vec![0.0; 4], vec![0, 1]);
        assert!((loss - std::f64::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_confident_correct_is_small_and_non_negative() {
        let loss = loss_of(&CrossEntropy::new(), vec![10.0, -10.0, -10.0, 10.0], vec![0, 1]);
        assert!(loss >= 0.0);
        assert!(loss < 1e-3);
    }

    #[test]
    fn test_smoothing_raises_loss_of_confident_predictions() {
        let logits = vec![10.0, -10.0, -10.0, 10.0];
        let plain = loss_of(&CrossEntropy::new(), logits.clone(), vec![0, 1]);
        let smoothed = loss_of(
            &CrossEntropy::new().with_smoothing(Some(0.1)),
            logits,
            vec![0, 1],
        );
        assert!(smoothed > plain);
    }
}
