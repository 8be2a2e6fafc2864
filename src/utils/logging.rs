//! Logging Module
//!
//! Structured logging on top of the `tracing` crate. `RUST_LOG` takes
//! precedence over the configured level when it is set.

use std::time::Instant;

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::utils::format_duration;
use crate::utils::metrics::EpochStats;

/// Verbosity of the global subscriber; parses from and prints as a filter
/// directive (`"debug"`, `"warn"`, ...)
pub type LogLevel = Level;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Prefix events with their module path
    pub show_module: bool,
    /// Tag events with the emitting thread, useful with loader workers
    pub show_thread: bool,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::at(Level::INFO)
    }
}

impl LogConfig {
    /// Plain output at `level`
    pub fn at(level: LogLevel) -> Self {
        Self {
            level,
            show_module: false,
            show_thread: false,
            ansi: true,
        }
    }

    /// Debug level, with module paths and loader thread ids
    pub fn verbose() -> Self {
        Self {
            show_module: true,
            show_thread: true,
            ..Self::at(Level::DEBUG)
        }
    }

    pub fn quiet() -> Self {
        Self::at(Level::ERROR)
    }

    /// Level named by `name`, keeping the other settings
    pub fn with_level_name(mut self, name: &str) -> Self {
        if let Ok(level) = name.parse() {
            self.level = level;
        }
        self
    }
}

/// Install the global subscriber
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string().to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(config.show_module)
        .with_thread_ids(config.show_thread)
        .compact()
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {}", e))
}

/// Times epochs of a training run and reports an ETA
pub struct TrainingLogger {
    epoch: usize,
    total_epochs: usize,
    epoch_start: Instant,
    training_start: Instant,
}

impl TrainingLogger {
    pub fn new(total_epochs: usize) -> Self {
        Self {
            epoch: 0,
            total_epochs,
            epoch_start: Instant::now(),
            training_start: Instant::now(),
        }
    }

    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.epoch_start = Instant::now();

        tracing::info!("Epoch {}/{} started", epoch + 1, self.total_epochs);
    }

    /// Report `stats` with timing and the remaining-time estimate
    pub fn end_epoch(&self, stats: &EpochStats, learning_rate: f64) {
        let epoch_time = self.epoch_start.elapsed().as_secs_f64();
        let total_time = self.training_start.elapsed().as_secs_f64();

        let epochs_remaining = self.total_epochs.saturating_sub(self.epoch + 1);
        let eta_secs = epochs_remaining as f64 * total_time / (self.epoch + 1) as f64;

        tracing::info!(
            "Epoch {}/{} completed in {} | {} | LR: {:.6} | ETA: {}",
            self.epoch + 1,
            self.total_epochs,
            format_duration(epoch_time),
            stats,
            learning_rate,
            format_duration(eta_secs)
        );

        if stats.recall.is_none() {
            tracing::warn!(
                "Epoch {}: recall undefined, no positive samples seen",
                self.epoch + 1
            );
        }
    }

    pub fn log_complete(&self, last: Option<&EpochStats>) {
        let total_time = self.training_start.elapsed().as_secs_f64();

        match last {
            Some(stats) => tracing::info!(
                "Training complete! {} epochs in {} | final {}",
                self.total_epochs,
                format_duration(total_time),
                stats
            ),
            None => tracing::info!("Training complete! no epochs were run"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(LogConfig::default().level, Level::INFO);
        assert_eq!(LogConfig::quiet().level, Level::ERROR);

        let verbose = LogConfig::verbose();
        assert_eq!(verbose.level, Level::DEBUG);
        assert!(verbose.show_thread);
    }

    #[test]
    fn test_level_names() {
        assert_eq!(LogConfig::default().with_level_name("warn").level, Level::WARN);
        assert_eq!(LogConfig::default().with_level_name("TRACE").level, Level::TRACE);
        assert_eq!(LogConfig::quiet().with_level_name("loud").level, Level::ERROR);
        assert!(EnvFilter::try_new(Level::DEBUG.to_string().to_lowercase()).is_ok());
    }

    #[test]
    fn test_training_logger_tracks_epoch() {
        let mut logger = TrainingLogger::new(3);
        logger.start_epoch(1);
        assert_eq!(logger.epoch, 1);
        logger.log_complete(None);
    }
}
