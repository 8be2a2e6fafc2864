//! Experiment orchestration
//!
//! Glue between the loaders, the trainer and the validator. The default path
//! trains the whole network on image batches; the precomputed path runs the
//! frozen backbone once and trains only the classifier head on its features.

use burn::{
    module::AutodiffModule,
    optim::{momentum::MomentumConfig, AdamConfig, Optimizer, SgdConfig},
    tensor::backend::AutodiffBackend,
};
use tracing::{info, warn};

use crate::config::{ExperimentConfig, ModelConfig, OptimizerKind, OutputConfig, TrainingConfig};
use crate::dataset::{
    create_preconvfeat_loader, split_loaders_on, split_train_valid_sets, FeatureLoaderConfig,
    SplitLoaders,
};
use crate::model::{ClassifierHead, VggConfig, VggNet};
use crate::training::criterion::{CrossEntropy, Criterion};
use crate::training::trainer::{Trainer, TrainerConfig};
use crate::training::validator::{ValidationOutput, Validator, ValidatorConfig};
use crate::utils::charts::SvgChartVisualizer;
use crate::utils::error::{Result, TransferError};
use crate::utils::metrics::TrainingHistory;

/// What a finished run hands back
pub struct PipelineOutcome<B: AutodiffBackend> {
    pub model: VggNet<B>,
    pub history: TrainingHistory,
    pub validation: ValidationOutput,
    /// Class names, indexed by label
    pub classes: Vec<String>,
}

impl<B: AutodiffBackend> PipelineOutcome<B> {
    /// Write the enabled artifacts under the output directory
    pub fn save(&self, output: &OutputConfig) -> Result<()> {
        std::fs::create_dir_all(&output.output_dir)?;

        if output.save_model {
            self.model.save(output.model_path())?;
            info!("Model saved to {:?}", output.model_path());
        }
        if output.save_predictions {
            self.validation.save_json(&output.predictions_path())?;
            std::fs::write(
                output.history_path(),
                serde_json::to_string_pretty(&self.history)?,
            )?;
            info!("Validation output saved to {:?}", output.predictions_path());
        }
        Ok(())
    }
}

/// Momentum SGD or Adam, as configured
///
/// The two optimizers have distinct types, so callers get the burn config back
/// and initialize it for the module they train.
pub enum OptimizerChoice {
    Sgd(SgdConfig),
    Adam(AdamConfig),
}

pub fn build_optimizer(training: &TrainingConfig) -> OptimizerChoice {
    match training.optimizer {
        OptimizerKind::Sgd => {
            let momentum = training
                .momentum
                .map(|m| MomentumConfig::new().with_momentum(m).with_dampening(0.0));
            OptimizerChoice::Sgd(SgdConfig::new().with_momentum(momentum))
        }
        OptimizerKind::Adam => OptimizerChoice::Adam(AdamConfig::new()),
    }
}

/// Build the network for `model` on top of the `arch` layout
///
/// With a weights file the network is first built with the pretrained class
/// count, loaded, then given a fresh output layer for `model.num_classes`.
pub fn build_model<B: AutodiffBackend>(
    arch: VggConfig,
    model: &ModelConfig,
    device: &B::Device,
) -> Result<VggNet<B>> {
    let mut net = match &model.weights {
        Some(path) => arch
            .with_num_classes(model.pretrained_classes)
            .init::<B>(device)
            .load_pretrained(path, device)?
            .with_num_classes(model.num_classes, device),
        None => arch.with_num_classes(model.num_classes).init::<B>(device),
    };

    if model.freeze_features {
        info!("Freezing convolutional features");
        net = net.freeze_features();
    }
    Ok(net)
}

/// Fail when the data has more classes than the head has outputs
fn check_head_width<BT, BV>(loaders: &SplitLoaders<BT, BV>, head_width: usize) -> Result<()>
where
    BT: burn::tensor::backend::Backend,
    BV: burn::tensor::backend::Backend,
{
    let labels = loaders.num_labels();
    if labels > head_width {
        return Err(TransferError::ShapeMismatch(format!(
            "data has {} classes ({}) but the model outputs {} scores",
            labels,
            loaders.classes.join(", "),
            head_width
        )));
    }
    if labels < head_width {
        warn!(
            "Model outputs {} scores for {} classes in the data",
            head_width, labels
        );
    }
    Ok(())
}

fn validator_for<C: Criterion>(config: &ExperimentConfig, criterion: C) -> Validator<C> {
    Validator::new(
        criterion,
        ValidatorConfig::new(config.model.num_classes, config.training.positive_class),
    )
}

/// Split, train the full model on images, validate
pub fn run_pipeline<B, O, C>(
    config: &ExperimentConfig,
    model: VggNet<B>,
    optimizer: O,
    criterion: C,
    device: &B::Device,
) -> Result<PipelineOutcome<B>>
where
    B: AutodiffBackend,
    O: Optimizer<VggNet<B>, B>,
    C: Criterion + Clone,
{
    let loaders = split_train_valid_sets::<B>(&config.loader, &config.data, device)?;
    check_head_width(&loaders, model.num_classes())?;

    let mut trainer = Trainer::new(
        model,
        optimizer,
        criterion.clone(),
        TrainerConfig::from_config(&config.training),
    );
    if config.output.save_chart {
        trainer = trainer.with_visualizer(Box::new(
            SvgChartVisualizer::new(config.output.chart_path()).with_title("Training History"),
        ));
    }

    info!("Training on {} images", loaders.train_size);
    let history = trainer.fit(&loaders.train, loaders.train_size)?;
    let model = trainer.into_model();

    info!("Validating on {} images", loaders.valid_size);
    let validation = validator_for(config, criterion).validate(
        &model.valid(),
        &loaders.valid,
        loaders.valid_size,
    )?;

    Ok(PipelineOutcome {
        model,
        history,
        validation,
        classes: loaders.classes,
    })
}

/// Split, precompute backbone features, train the head on them, validate
///
/// The trained head replaces the classifier of `model` in the outcome.
pub fn run_precomputed_pipeline<B, O, C>(
    config: &ExperimentConfig,
    model: VggNet<B>,
    optimizer: O,
    criterion: C,
    device: &B::Device,
) -> Result<PipelineOutcome<B>>
where
    B: AutodiffBackend,
    O: Optimizer<ClassifierHead<B>, B>,
    C: Criterion + Clone,
{
    let loaders = split_loaders_on::<B::InnerBackend, B::InnerBackend>(
        &config.loader,
        &config.data,
        device,
        device,
    )?;
    check_head_width(&loaders, model.num_classes())?;
    let backbone = model.valid();
    let batch_size = config.loader.batch_size_preconvfeat;

    info!("Precomputing training features");
    let train_features = create_preconvfeat_loader::<_, B, _, _>(
        &loaders.train,
        &backbone,
        &FeatureLoaderConfig::new(batch_size, config.loader.shuffle_train)
            .with_seed(config.loader.seed),
        device,
    )?;

    info!("Precomputing validation features");
    let valid_features = create_preconvfeat_loader::<_, B::InnerBackend, _, _>(
        &loaders.valid,
        &backbone,
        &FeatureLoaderConfig::new(batch_size, config.loader.shuffle_valid)
            .with_seed(config.loader.seed),
        device,
    )?;
    drop(backbone);

    let mut trainer = Trainer::new(
        model.classifier.clone(),
        optimizer,
        criterion.clone(),
        TrainerConfig::from_config(&config.training),
    );
    if config.output.save_chart {
        trainer = trainer.with_visualizer(Box::new(
            SvgChartVisualizer::new(config.output.chart_path())
                .with_title("Training History (precomputed features)"),
        ));
    }

    let history = trainer.fit(&train_features, loaders.train_size)?;
    let head = trainer.into_model();

    let validation = validator_for(config, criterion).validate(
        &head.valid(),
        &valid_features,
        loaders.valid_size,
    )?;

    let mut model = model;
    model.classifier = head;

    Ok(PipelineOutcome {
        model,
        history,
        validation,
        classes: loaders.classes,
    })
}

/// Run the path and optimizer `config` selects, with cross-entropy loss
pub fn run_experiment<B: AutodiffBackend>(
    config: &ExperimentConfig,
    model: VggNet<B>,
    device: &B::Device,
) -> Result<PipelineOutcome<B>> {
    config.validate()?;
    let criterion = CrossEntropy::from_config(&config.training);

    info!(
        "Running {} pipeline with {}",
        if config.training.precompute {
            "precomputed-feature"
        } else {
            "full-model"
        },
        config.training.optimizer
    );

    match (build_optimizer(&config.training), config.training.precompute) {
        (OptimizerChoice::Sgd(sgd), false) => run_pipeline(
            config,
            model,
            sgd.init::<B, VggNet<B>>(),
            criterion,
            device,
        ),
        (OptimizerChoice::Adam(adam), false) => run_pipeline(
            config,
            model,
            adam.init::<B, VggNet<B>>(),
            criterion,
            device,
        ),
        (OptimizerChoice::Sgd(sgd), true) => run_precomputed_pipeline(
            config,
            model,
            sgd.init::<B, ClassifierHead<B>>(),
            criterion,
            device,
        ),
        (OptimizerChoice::Adam(adam), true) => run_precomputed_pipeline(
            config,
            model,
            adam.init::<B, ClassifierHead<B>>(),
            criterion,
            device,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::image_folder::tests::write_data_dir;
    use crate::model::vgg::tests::tiny_config;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    fn tiny_experiment(data: &TempDir, output: &TempDir) -> ExperimentConfig {
        let mut config = ExperimentConfig::default();
        config.data.data_dir = data.path().to_path_buf();
        config.data.crop_size = 8;
        config.loader.batch_size_train = 4;
        config.loader.batch_size_valid = 3;
        config.loader.batch_size_preconvfeat = 5;
        config.loader.num_workers = 2;
        config.training.epochs = 2;
        config.training.learning_rate = 0.001;
        config.output.output_dir = output.path().join("run");
        config
    }

    #[test]
    fn test_full_pipeline_populates_validation() {
        let data = write_data_dir(&["cats", "dogs"], 5, 3, 10);
        let output = TempDir::new().unwrap();
        let config = tiny_experiment(&data, &output);
        let device = Default::default();

        let model = tiny_config(2).init::<TestBackend>(&device);
        let outcome = run_pipeline(
            &config,
            model,
            SgdConfig::new().init::<TestBackend, VggNet<TestBackend>>(),
            CrossEntropy::new(),
            &device,
        )
        .unwrap();

        assert_eq!(outcome.classes, vec!["cats", "dogs"]);
        assert_eq!(outcome.history.len(), 2);
        assert!(outcome.history.epochs.iter().all(|s| s.samples == 10));
        assert_eq!(outcome.validation.len(), 6);
        assert_eq!(outcome.validation.scores.len(), 12);
        assert_eq!(outcome.validation.classes, vec![0, 0, 0, 1, 1, 1]);
        assert!(config.output.chart_path().exists());
    }

    #[test]
    fn test_precomputed_pipeline_trains_head_only() {
        let data = write_data_dir(&["cats", "dogs"], 4, 2, 8);
        let output = TempDir::new().unwrap();
        let mut config = tiny_experiment(&data, &output);
        config.training.precompute = true;
        let device = Default::default();

        let model = tiny_config(2).init::<TestBackend>(&device);
        let backbone_before = model.valid().features.len();
        let outcome = run_precomputed_pipeline(
            &config,
            model,
            AdamConfig::new().init::<TestBackend, ClassifierHead<TestBackend>>(),
            CrossEntropy::new(),
            &device,
        )
        .unwrap();

        assert_eq!(outcome.history.len(), 2);
        assert_eq!(outcome.validation.len(), 4);
        assert_eq!(outcome.model.features.len(), backbone_before);
        assert_eq!(outcome.model.num_classes(), 2);
    }

    #[test]
    fn test_experiment_saves_artifacts() {
        let data = write_data_dir(&["a", "b"], 2, 2, 8);
        let output = TempDir::new().unwrap();
        let mut config = tiny_experiment(&data, &output);
        config.training.optimizer = OptimizerKind::Adam;
        config.training.epochs = 1;
        let device = Default::default();

        let model = tiny_config(2).init::<TestBackend>(&device);
        let outcome = run_experiment(&config, model, &device).unwrap();
        outcome.save(&config.output).unwrap();

        assert!(config.output.predictions_path().exists());
        assert!(config.output.history_path().exists());
        assert!(config.output.output_dir.join("model.mpk").exists());
    }

    #[test]
    fn test_experiment_rejects_invalid_config() {
        let data = write_data_dir(&["a", "b"], 1, 1, 8);
        let output = TempDir::new().unwrap();
        let mut config = tiny_experiment(&data, &output);
        config.training.epochs = 0;
        let device = Default::default();

        let model = tiny_config(2).init::<TestBackend>(&device);
        let result = run_experiment(&config, model, &device);
        assert!(matches!(result, Err(TransferError::Config(_))));
    }

    #[test]
    fn test_more_classes_than_outputs_is_shape_error() {
        let data = write_data_dir(&["a", "b", "c"], 2, 2, 8);
        let output = TempDir::new().unwrap();
        let config = tiny_experiment(&data, &output);
        let device = Default::default();

        let result = run_pipeline(
            &config,
            tiny_config(2).init::<TestBackend>(&device),
            SgdConfig::new().init::<TestBackend, VggNet<TestBackend>>(),
            CrossEntropy::new(),
            &device,
        );
        assert!(matches!(result, Err(TransferError::ShapeMismatch(_))));

        let result = run_precomputed_pipeline(
            &config,
            tiny_config(2).init::<TestBackend>(&device),
            SgdConfig::new().init::<TestBackend, ClassifierHead<TestBackend>>(),
            CrossEntropy::new(),
            &device,
        );
        assert!(matches!(result, Err(TransferError::ShapeMismatch(_))));
        assert!(!config.output.chart_path().exists());
    }

    #[test]
    fn test_build_model_from_weights() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let path = dir.path().join("pretrained");
        tiny_config(5)
            .init::<TestBackend>(&device)
            .save(&path)
            .unwrap();

        let model_config = ModelConfig {
            num_classes: 2,
            weights: Some(path),
            pretrained_classes: 5,
            freeze_features: true,
            ..ModelConfig::default()
        };
        let model = build_model::<TestBackend>(tiny_config(0), &model_config, &device).unwrap();
        assert_eq!(model.num_classes(), 2);
    }

    #[test]
    fn test_build_optimizer_matches_kind() {
        let mut training = TrainingConfig::default();
        assert!(matches!(build_optimizer(&training), OptimizerChoice::Sgd(_)));
        training.optimizer = OptimizerKind::Adam;
        assert!(matches!(build_optimizer(&training), OptimizerChoice::Adam(_)));
    }
}
