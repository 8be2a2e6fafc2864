//! Epoch-based training loop
//!
//! The trainer owns the model for the duration of training. Each batch runs
//! forward, loss, backward and one optimizer step; per-epoch loss, accuracy
//! and recall are accumulated in [`RunningStats`] and collected into a
//! [`TrainingHistory`].

use std::marker::PhantomData;

use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use tracing::{debug, info};

use crate::config::TrainingConfig;
use crate::dataset::{BatchSource, ClassificationBatch};
use crate::model::Classify;
use crate::training::criterion::Criterion;
use crate::training::host_predictions;
use crate::utils::charts::Visualizer;
use crate::utils::error::Result;
use crate::utils::logging::TrainingLogger;
use crate::utils::metrics::{RunningStats, TrainingHistory};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    /// Label counted as positive for recall
    pub positive_class: usize,
}

impl TrainerConfig {
    pub fn new(epochs: usize, learning_rate: f64) -> Self {
        Self {
            epochs,
            learning_rate,
            positive_class: 1,
        }
    }

    pub fn with_positive_class(mut self, positive_class: usize) -> Self {
        self.positive_class = positive_class;
        self
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(config.epochs, config.learning_rate).with_positive_class(config.positive_class)
    }
}

pub struct Trainer<B, M, O, C>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
    C: Criterion,
{
    model: M,
    optimizer: O,
    criterion: C,
    config: TrainerConfig,
    visualizer: Option<Box<dyn Visualizer>>,
    _backend: PhantomData<B>,
}

impl<B, M, O, C> Trainer<B, M, O, C>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
    C: Criterion,
{
    pub fn new(model: M, optimizer: O, criterion: C, config: TrainerConfig) -> Self {
        Self {
            model,
            optimizer,
            criterion,
            config,
            visualizer: None,
            _backend: PhantomData,
        }
    }

    /// Receives the history once all epochs finish
    pub fn with_visualizer(mut self, visualizer: Box<dyn Visualizer>) -> Self {
        self.visualizer = Some(visualizer);
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Give back the trained model
    pub fn into_model(self) -> M {
        self.model
    }

    /// Train for the configured number of epochs over `source`
    ///
    /// `size` is the number of samples one pass over `source` yields; loss
    /// and accuracy are divided by it, and a pass producing a different count
    /// is an error.
    pub fn fit<const D: usize, S>(&mut self, source: &S, size: usize) -> Result<TrainingHistory>
    where
        M: Classify<B, D>,
        S: BatchSource<ClassificationBatch<B, D>> + ?Sized,
    {
        let mut history = TrainingHistory::new();
        let mut logger = TrainingLogger::new(self.config.epochs);

        info!(
            "Training for {} epochs over {} samples ({} batches per epoch, lr {})",
            self.config.epochs,
            size,
            source.num_batches(),
            self.config.learning_rate
        );

        for epoch in 0..self.config.epochs {
            logger.start_epoch(epoch);

            let running = self.train_epoch(source)?;
            let stats = running.finalize(size)?;

            println!("{}", stats);
            logger.end_epoch(&stats, self.config.learning_rate);
            history.push(stats);
        }

        logger.log_complete(history.last());

        if let Some(visualizer) = &self.visualizer {
            visualizer.render(&history)?;
        }

        Ok(history)
    }

    fn train_epoch<const D: usize, S>(&mut self, source: &S) -> Result<RunningStats>
    where
        M: Classify<B, D>,
        S: BatchSource<ClassificationBatch<B, D>> + ?Sized,
    {
        let mut running = RunningStats::new();
        let num_batches = source.num_batches();

        for (batch_idx, batch) in source.batches().enumerate() {
            let batch = batch?;

            let logits = self.model.classify(batch.inputs);
            let loss = self.criterion.loss(logits.clone(), batch.targets.clone());
            let batch_loss: f64 = loss.clone().into_scalar().elem();

            let (predictions, targets) = host_predictions(logits, batch.targets)?;

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            self.model = self
                .optimizer
                .step(self.config.learning_rate, self.model.clone(), grads);

            running.update(
                batch_loss,
                &predictions,
                &targets,
                self.config.positive_class,
            );

            if (batch_idx + 1) % 10 == 0 || batch_idx + 1 == num_batches {
                debug!(
                    "  Batch {}/{}: loss = {:.4}, {} samples so far",
                    batch_idx + 1,
                    num_batches,
                    batch_loss,
                    running.samples
                );
            }
        }

        Ok(running)
    }
}
