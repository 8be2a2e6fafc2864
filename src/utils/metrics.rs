//! Metrics Module for Training and Validation
//!
//! Provides the running statistics accumulated over mini-batches during an
//! epoch, the finalized per-epoch statistics, and a confusion matrix for
//! inspecting validation predictions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, TransferError};

/// Per-epoch counters, reset at the start of every epoch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningStats {
    /// Sum of the per-batch loss values
    pub loss_sum: f64,

    /// Predictions equal to the target label
    pub correct: usize,

    /// Samples where prediction and label both equal the positive class
    pub true_positives: usize,

    /// Samples labeled with the positive class
    pub positives: usize,

    /// Samples seen so far
    pub samples: usize,
}

impl RunningStats {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one batch worth of results
    ///
    /// `batch_loss` is the criterion value reported for the batch;
    /// `predictions` and `targets` hold one class index per sample.
    pub fn update(
        &mut self,
        batch_loss: f64,
        predictions: &[usize],
        targets: &[usize],
        positive_class: usize,
    ) {
        debug_assert_eq!(predictions.len(), targets.len());

        self.loss_sum += batch_loss;

        for (&pred, &target) in predictions.iter().zip(targets.iter()) {
            if pred == target {
                self.correct += 1;
                if target == positive_class {
                    self.true_positives += 1;
                }
            }
            if target == positive_class {
                self.positives += 1;
            }
        }

        self.samples += targets.len();
    }

    /// Turn the counters into epoch statistics
    ///
    /// Loss and accuracy are divided by the declared dataset `size`, which
    /// must equal the number of samples actually accumulated.
    pub fn finalize(&self, size: usize) -> Result<EpochStats> {
        if self.samples != size {
            return Err(TransferError::SizeMismatch {
                expected: size,
                actual: self.samples,
            });
        }
        if size == 0 {
            return Err(TransferError::Dataset(
                "cannot compute statistics over zero samples".to_string(),
            ));
        }

        let recall = if self.positives > 0 {
            Some(self.true_positives as f64 / self.positives as f64)
        } else {
            None
        };

        Ok(EpochStats {
            loss: self.loss_sum / size as f64,
            accuracy: self.correct as f64 / size as f64,
            recall,
            samples: size,
        })
    }
}

/// Loss, accuracy and recall for one pass over a dataset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// Summed batch loss divided by the dataset size
    pub loss: f64,

    /// Correct predictions divided by the dataset size
    pub accuracy: f64,

    /// True positives over positives; `None` when the pass had no positives
    pub recall: Option<f64>,

    /// Number of samples in the pass
    pub samples: usize,
}

impl fmt::Display for EpochStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Loss: {:.4} Acc: {:.4} Recall: ", self.loss, self.accuracy)?;
        match self.recall {
            Some(recall) => write!(f, "{:.4}", recall),
            None => write!(f, "undefined"),
        }
    }
}

/// Statistics of every epoch of a training run, in order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochStats>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stats: EpochStats) {
        self.epochs.push(stats);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochStats> {
        self.epochs.last()
    }

    pub fn losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.loss).collect()
    }

    pub fn accuracies(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.accuracy).collect()
    }

    /// Per-epoch recall; undefined epochs stay `None`
    pub fn recalls(&self) -> Vec<Option<f64>> {
        self.epochs.iter().map(|e| e.recall).collect()
    }
}

/// Precision and recall of one class, one-vs-rest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub class: usize,
    pub true_positives: usize,
    /// Times the class was predicted
    pub predicted: usize,
    /// Samples whose label is the class
    pub support: usize,
    /// `None` when the class was never predicted
    pub precision: Option<f64>,
    /// `None` when the class has no samples
    pub recall: Option<f64>,
}

impl ClassMetrics {
    fn from_counts(class: usize, true_positives: usize, predicted: usize, support: usize) -> Self {
        let ratio = |den: usize| (den > 0).then(|| true_positives as f64 / den as f64);
        Self {
            class,
            true_positives,
            predicted,
            support,
            precision: ratio(predicted),
            recall: ratio(support),
        }
    }
}

/// Label-by-prediction counts; rows are labels, columns predictions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    rows: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            rows: vec![vec![0; num_classes]; num_classes],
        }
    }

    pub fn from_predictions(predictions: &[usize], labels: &[usize], num_classes: usize) -> Self {
        let mut matrix = Self::new(num_classes);
        predictions
            .iter()
            .zip(labels)
            .for_each(|(&predicted, &label)| matrix.add(label, predicted));
        matrix
    }

    pub fn num_classes(&self) -> usize {
        self.rows.len()
    }

    /// Count one sample; out-of-range classes are ignored
    pub fn add(&mut self, label: usize, predicted: usize) {
        if let Some(cell) = self.rows.get_mut(label).and_then(|r| r.get_mut(predicted)) {
            *cell += 1;
        }
    }

    pub fn get(&self, label: usize, predicted: usize) -> usize {
        self.rows
            .get(label)
            .and_then(|r| r.get(predicted))
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.rows.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        self.rows.iter().enumerate().map(|(i, r)| r[i]).sum()
    }

    /// Fraction on the diagonal, zero for an empty matrix
    pub fn accuracy(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.correct() as f64 / total as f64,
        }
    }

    pub fn per_class(&self) -> Vec<ClassMetrics> {
        (0..self.num_classes())
            .map(|class| {
                let predicted = self.rows.iter().map(|r| r[class]).sum();
                let support = self.rows[class].iter().sum();
                ClassMetrics::from_counts(class, self.rows[class][class], predicted, support)
            })
            .collect()
    }

    /// Text table, labels down the side and predictions across
    pub fn display(&self, class_names: Option<&[String]>) -> String {
        let name = |i: usize| -> String {
            class_names
                .and_then(|names| names.get(i))
                .map(|n| n.chars().take(10).collect())
                .unwrap_or_else(|| i.to_string())
        };

        let mut out = format!("{:>12} | predicted\n", "label");
        out.push_str(&format!("{:>12} |", ""));
        for col in 0..self.num_classes() {
            out.push_str(&format!(" {:>10}", name(col)));
        }
        out.push('\n');
        for (row, counts) in self.rows.iter().enumerate() {
            out.push_str(&format!("{:>12} |", name(row)));
            for count in counts {
                out.push_str(&format!(" {:>10}", count));
            }
            out.push('\n');
        }
        out
    }
}
