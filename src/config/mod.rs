pub mod constants;
pub mod model;
pub mod training;

use thiserror::Error;

pub use constants::{
    ensure_checkpoint_dir, TaskMode, CHECKPOINT_DIR, MAX_SEQ_LENGTH, NUM_CHOICES,
    TRACKER_PROJECT, TRAIN_LOADER_WORKERS, WATCH_LOG_FREQ,
};
pub use model::{AdapterConfig, QuantizationConfig};
pub use training::RunConfig;

/// Errors raised when a configuration value names something that does not exist or is out of range
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown optimizer '{0}' (expected one of: adamw, adam, sgd)")]
    UnknownOptimizer(String),

    #[error(
        "unknown lr scheduler '{0}' (expected one of: linear, constant, constant_with_warmup, cosine, cosine_warmup)"
    )]
    UnknownScheduler(String),

    #[error("unknown task mode '{0}' (expected one of: zero-shot, few-shot, lora-fine-tune)")]
    UnknownTaskMode(String),

    #[error("{0} must be at least 1")]
    ZeroValue(&'static str),
}
