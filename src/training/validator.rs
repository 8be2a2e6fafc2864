//! Single-pass validation
//!
//! Runs a read-only model over a batch source once, collecting per-sample
//! predictions, raw class scores and ground-truth labels into buffers sized
//! by the declared dataset size. Any disagreement between the declared size
//! and what the source actually yields is an error.

use std::fs;
use std::path::Path;

use burn::tensor::{backend::Backend, ElementConversion};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dataset::{BatchSource, ClassificationBatch};
use crate::model::Classify;
use crate::training::criterion::Criterion;
use crate::training::host_predictions;
use crate::utils::error::{Result, TransferError};
use crate::utils::metrics::{ConfusionMatrix, EpochStats, RunningStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorConfig {
    /// Label counted as positive for recall
    pub positive_class: usize,
    /// Width of each score row
    pub num_classes: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            positive_class: 1,
            num_classes: 2,
        }
    }
}

impl ValidatorConfig {
    pub fn new(num_classes: usize, positive_class: usize) -> Self {
        Self {
            positive_class,
            num_classes,
        }
    }
}

/// Everything one validation pass produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutput {
    /// Arg-max class per sample
    pub predictions: Vec<usize>,
    /// Raw model outputs, row-major `[samples, num_classes]`
    pub scores: Vec<f32>,
    /// Ground-truth label per sample
    pub classes: Vec<usize>,
    pub num_classes: usize,
    pub stats: EpochStats,
}

impl ValidationOutput {
    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }

    /// Raw scores of sample `index`
    pub fn score_row(&self, index: usize) -> Option<&[f32]> {
        let k = self.num_classes;
        self.scores.get(index * k..(index + 1) * k)
    }

    /// Scores turned into per-row softmax probabilities
    pub fn probabilities(&self) -> Vec<f32> {
        let k = self.num_classes.max(1);
        let mut probs = Vec::with_capacity(self.scores.len());
        for row in self.scores.chunks(k) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let exps: Vec<f32> = row.iter().map(|s| (s - max).exp()).collect();
            let sum: f32 = exps.iter().sum();
            probs.extend(exps.into_iter().map(|e| e / sum));
        }
        probs
    }

    pub fn confusion_matrix(&self) -> ConfusionMatrix {
        ConfusionMatrix::from_predictions(&self.predictions, &self.classes, self.num_classes)
    }

    /// Write as pretty JSON, creating parent directories
    pub fn save_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

pub struct Validator<C: Criterion> {
    criterion: C,
    config: ValidatorConfig,
}

impl<C: Criterion> Validator<C> {
    pub fn new(criterion: C, config: ValidatorConfig) -> Self {
        Self { criterion, config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// One pass over `source`, which must yield exactly `size` samples
    pub fn validate<B, M, S, const D: usize>(
        &self,
        model: &M,
        source: &S,
        size: usize,
    ) -> Result<ValidationOutput>
    where
        B: Backend,
        M: Classify<B, D>,
        S: BatchSource<ClassificationBatch<B, D>> + ?Sized,
    {
        let k = self.config.num_classes;
        let mut predictions = vec![0usize; size];
        let mut classes = vec![0usize; size];
        let mut scores = vec![0f32; size * k];

        let mut running = RunningStats::new();
        let mut offset = 0usize;

        for batch in source.batches() {
            let batch = batch?;
            let n = batch.len();

            if offset + n > size {
                return Err(TransferError::SizeMismatch {
                    expected: size,
                    actual: offset + n,
                });
            }

            let logits = model.classify(batch.inputs);
            let [rows, width] = logits.dims();
            if width != k || rows != n {
                return Err(TransferError::ShapeMismatch(format!(
                    "expected scores of shape [{}, {}], got [{}, {}]",
                    n, k, rows, width
                )));
            }

            let loss = self.criterion.loss(logits.clone(), batch.targets.clone());
            let batch_loss: f64 = loss.into_scalar().elem();

            let raw = logits.clone().into_data().convert::<f32>().to_vec::<f32>()?;
            let (preds, targets) = host_predictions(logits, batch.targets)?;

            predictions[offset..offset + n].copy_from_slice(&preds);
            classes[offset..offset + n].copy_from_slice(&targets);
            scores[offset * k..(offset + n) * k].copy_from_slice(&raw);

            running.update(batch_loss, &preds, &targets, self.config.positive_class);
            offset += n;
        }

        if offset != size {
            return Err(TransferError::SizeMismatch {
                expected: size,
                actual: offset,
            });
        }

        let stats = running.finalize(size)?;
        println!("{}", stats);
        info!("Validation over {} samples | {}", size, stats);
        if stats.recall.is_none() {
            warn!(
                "Validation recall undefined, no samples of class {}",
                self.config.positive_class
            );
        }

        Ok(ValidationOutput {
            predictions,
            scores,
            classes,
            num_classes: k,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::vgg::tests::tiny_config;
    use crate::model::ClassifierHead;
    use crate::training::criterion::CrossEntropy;
    use crate::training::test_utils::separable_batches;
    use burn::tensor::{Distribution, Int, Tensor, TensorData};
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn validator() -> Validator<CrossEntropy> {
        Validator::new(CrossEntropy::new(), ValidatorConfig::default())
    }

    fn head() -> ClassifierHead<TestBackend> {
        ClassifierHead::new(4, 8, 2, 0.0, &Default::default())
    }

    #[test]
    fn test_outputs_fully_populated() {
        let device = Default::default();
        let source = separable_batches::<TestBackend>(12, 5, 4, &device);

        let output = validator().validate(&head(), &source, 12).unwrap();

        assert_eq!(output.len(), 12);
        assert_eq!(output.scores.len(), 24);
        assert_eq!(output.classes, (0..12).map(|i| i % 2).collect::<Vec<_>>());
        assert!(output.predictions.iter().all(|&p| p < 2));
        assert!((0.0..=1.0).contains(&output.stats.accuracy));
        assert!(output.stats.loss >= 0.0);
        assert_eq!(output.confusion_matrix().total(), 12);
    }

    #[test]
    fn test_short_source_is_size_mismatch() {
        let device = Default::default();
        let source = separable_batches::<TestBackend>(15, 5, 4, &device);

        let err = validator().validate(&head(), &source, 20).unwrap_err();
        assert!(matches!(
            err,
            TransferError::SizeMismatch {
                expected: 20,
                actual: 15
            }
        ));
    }

    #[test]
    fn test_long_source_is_size_mismatch() {
        let device = Default::default();
        let source = separable_batches::<TestBackend>(15, 5, 4, &device);

        let err = validator().validate(&head(), &source, 12).unwrap_err();
        assert!(matches!(
            err,
            TransferError::SizeMismatch {
                expected: 12,
                actual: 15
            }
        ));
    }

    #[test]
    fn test_width_mismatch_is_shape_error() {
        let device = Default::default();
        let source = separable_batches::<TestBackend>(4, 2, 4, &device);
        let three_way = ClassifierHead::<TestBackend>::new(4, 8, 3, 0.0, &device);

        let err = validator().validate(&three_way, &source, 4).unwrap_err();
        assert!(matches!(err, TransferError::ShapeMismatch(_)));

        let wide = Validator::new(CrossEntropy::new(), ValidatorConfig::new(3, 1));
        assert_eq!(wide.validate(&three_way, &source, 4).unwrap().scores.len(), 12);
    }

    #[test]
    fn test_validation_is_idempotent() {
        let device = Default::default();
        let model = tiny_config(2).init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::random([6, 3, 8, 8], Distribution::Default, &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_data(
            TensorData::new(vec![0i64, 1, 1, 0, 1, 0], [6]),
            &device,
        );
        let source = vec![
            ClassificationBatch::new(images.clone().slice([0..4]), targets.clone().slice([0..4])),
            ClassificationBatch::new(images.slice([4..6]), targets.slice([4..6])),
        ];

        let first = validator().validate(&model, &source, 6).unwrap();
        let second = validator().validate(&model, &source, 6).unwrap();

        assert_eq!(first.predictions, second.predictions);
        assert_eq!(first.scores, second.scores);
        assert_eq!(first.classes, vec![0, 1, 1, 0, 1, 0]);
    }

    #[test]
    fn test_scores_are_raw_and_probabilities_normalized() {
        let output = ValidationOutput {
            predictions: vec![1, 0],
            scores: vec![0.0, 2.0, 3.0, 3.0],
            classes: vec![1, 1],
            num_classes: 2,
            stats: EpochStats {
                loss: 0.5,
                accuracy: 0.5,
                recall: Some(0.5),
                samples: 2,
            },
        };

        assert_eq!(output.score_row(1), Some(&[3.0f32, 3.0][..]));
        let probs = output.probabilities();
        assert!((probs[0] + probs[1] - 1.0).abs() < 1e-6);
        assert!(probs[1] > probs[0]);
        assert!((probs[2] - 0.5).abs() < 1e-6);

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("validation.json");
        output.save_json(&path).unwrap();
        let back: ValidationOutput =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, output);
    }
}
