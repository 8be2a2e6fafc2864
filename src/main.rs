//! Transfer-learning image classifier CLI
//!
//! Fine-tunes a VGG network on a `train`/`valid` image folder and reports
//! per-epoch and validation metrics.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use transfer_classifier::backend::{backend_name, default_device, TrainingBackend};
use transfer_classifier::config::{DataConfig, ExperimentConfig, OptimizerKind};
use transfer_classifier::dataset::{prepare_datasets, ImageFolderDataset, ImageTransform};
use transfer_classifier::model::VggConfig;
use transfer_classifier::training::{build_model, run_experiment};
use transfer_classifier::utils::format_duration;
use transfer_classifier::utils::logging::{init_logging, LogConfig};

/// Fine-tune a pretrained VGG network on a directory of labelled images
#[derive(Parser, Debug)]
#[command(name = "transfer_classifier")]
#[command(version)]
#[command(about = "Transfer-learning image classification with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train on the train split and validate on the valid split
    Train {
        /// TOML configuration file; flags below override its values
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory holding the train and valid splits
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Number of training epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Learning rate
        #[arg(short, long)]
        learning_rate: Option<f64>,

        /// Batch size for training
        #[arg(long)]
        batch_size_train: Option<usize>,

        /// Batch size for validation
        #[arg(long)]
        batch_size_valid: Option<usize>,

        /// Worker threads loading images
        #[arg(long)]
        num_workers: Option<usize>,

        /// Optimizer (sgd, adam)
        #[arg(long)]
        optimizer: Option<OptimizerKind>,

        /// Pretrained weights record
        #[arg(short, long)]
        weights: Option<PathBuf>,

        /// Train only the classifier head on precomputed backbone features
        #[arg(long, default_value = "false")]
        precompute: bool,

        /// Output directory for the model, predictions and chart
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Show per-class sample counts of each split
    Stats {
        /// Directory holding the train and valid splits
        #[arg(short, long, default_value = "data")]
        data_dir: PathBuf,
    },

    /// Write the default configuration as TOML
    InitConfig {
        /// Destination file
        #[arg(short, long, default_value = "transfer.toml")]
        output: PathBuf,
    },
}

/// Flag values that override the configuration file
struct TrainOverrides {
    data_dir: Option<PathBuf>,
    epochs: Option<usize>,
    learning_rate: Option<f64>,
    batch_size_train: Option<usize>,
    batch_size_valid: Option<usize>,
    num_workers: Option<usize>,
    optimizer: Option<OptimizerKind>,
    weights: Option<PathBuf>,
    precompute: bool,
    output_dir: Option<PathBuf>,
}

impl TrainOverrides {
    fn apply(self, config: &mut ExperimentConfig) {
        if let Some(v) = self.data_dir {
            config.data.data_dir = v;
        }
        if let Some(v) = self.epochs {
            config.training.epochs = v;
        }
        if let Some(v) = self.learning_rate {
            config.training.learning_rate = v;
        }
        if let Some(v) = self.batch_size_train {
            config.loader.batch_size_train = v;
        }
        if let Some(v) = self.batch_size_valid {
            config.loader.batch_size_valid = v;
        }
        if let Some(v) = self.num_workers {
            config.loader.num_workers = v;
        }
        if let Some(v) = self.optimizer {
            config.training.optimizer = v;
        }
        if self.weights.is_some() {
            config.model.weights = self.weights;
        }
        if self.precompute {
            config.training.precompute = true;
        }
        if let Some(v) = self.output_dir {
            config.output.output_dir = v;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    let _ = init_logging(&log_config);

    print_banner();

    match cli.command {
        Commands::Train {
            config,
            data_dir,
            epochs,
            learning_rate,
            batch_size_train,
            batch_size_valid,
            num_workers,
            optimizer,
            weights,
            precompute,
            output_dir,
        } => {
            let mut experiment = match config {
                Some(path) => ExperimentConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => ExperimentConfig::default(),
            };
            TrainOverrides {
                data_dir,
                epochs,
                learning_rate,
                batch_size_train,
                batch_size_valid,
                num_workers,
                optimizer,
                weights,
                precompute,
                output_dir,
            }
            .apply(&mut experiment);

            cmd_train(&experiment)?;
        }

        Commands::Stats { data_dir } => {
            cmd_stats(&data_dir)?;
        }

        Commands::InitConfig { output } => {
            ExperimentConfig::default().save(&output)?;
            println!("{} {}", "Wrote default configuration to".green(), output.display());
        }
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
 +------------------------------------------------------+
 |   Transfer Classifier                                |
 |   VGG fine-tuning with Burn + Rust                   |
 +------------------------------------------------------+
  "#
        .green()
    );
}

fn cmd_train(config: &ExperimentConfig) -> Result<()> {
    config.validate()?;

    let started = Local::now();
    println!("{}", "Training Configuration:".cyan().bold());
    println!("  Started:        {}", started.format("%Y-%m-%d %H:%M:%S"));
    println!("  Backend:        {}", backend_name());
    println!("  Data:           {}", config.data.data_dir.display());
    println!("  Epochs:         {}", config.training.epochs);
    println!("  Learning rate:  {}", config.training.learning_rate);
    println!("  Optimizer:      {}", config.training.optimizer);
    println!(
        "  Batch sizes:    train {} / valid {}",
        config.loader.batch_size_train, config.loader.batch_size_valid
    );
    println!(
        "  Mode:           {}",
        if config.training.precompute {
            "precomputed features (head only)"
        } else {
            "full model"
        }
    );
    println!();

    let device = default_device();
    let arch = VggConfig::vgg16()
        .with_hidden_size(config.model.hidden_size)
        .with_dropout(config.model.dropout);
    let model = build_model::<TrainingBackend>(arch, &config.model, &device)?;
    if config.model.weights.is_none() {
        println!(
            "{} no pretrained weights given, starting from random initialization",
            "Warning:".yellow()
        );
    }

    let outcome = run_experiment(config, model, &device)?;
    outcome.save(&config.output)?;

    let elapsed = (Local::now() - started).num_milliseconds() as f64 / 1000.0;
    info!("Run finished in {}", format_duration(elapsed));

    println!();
    println!("{}", "Validation:".green().bold());
    println!("  {}", outcome.validation.stats);
    println!();
    println!("{}", outcome.validation.confusion_matrix().display(Some(outcome.classes.as_slice())));
    println!("  Output: {}", config.output.output_dir.display());

    Ok(())
}

fn cmd_stats(data_dir: &Path) -> Result<()> {
    info!("Computing dataset statistics for: {}", data_dir.display());

    if !data_dir.exists() {
        println!(
            "{} Dataset directory not found: {}",
            "Error:".red(),
            data_dir.display()
        );
        return Ok(());
    }

    let data = DataConfig {
        data_dir: data_dir.to_path_buf(),
        ..DataConfig::default()
    };
    let splits = prepare_datasets(&data, ImageTransform::with_crop(data.crop_size))?;

    print_split("Train", &splits.train);
    print_split("Valid", &splits.valid);

    Ok(())
}

fn print_split(name: &str, dataset: &ImageFolderDataset) {
    println!(
        "{} {} samples, {} classes ({})",
        format!("{}:", name).cyan().bold(),
        dataset.samples().len(),
        dataset.num_classes(),
        dataset.root().display()
    );
    for (class, count) in dataset.classes().iter().zip(dataset.class_counts()) {
        println!("  {:<30} {:>6}", class, count);
    }
    println!();
}
