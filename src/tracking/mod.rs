//! Local experiment tracking
//!
//! A run lives in `runs/{project}/{group}-{timestamp}/` and holds the
//! hyperparameter record (`config.json`) plus one JSON line per logged step
//! (`history.jsonl`).

pub mod run;
pub mod stats;

pub use run::{RunTracker, DEFAULT_RUNS_DIR};
pub use stats::TensorStats;

use serde_json::Value;

/// Which tensors the trainer reports while watching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Gradients,
    Parameters,
    All,
}

impl WatchMode {
    pub fn gradients(self) -> bool {
        matches!(self, WatchMode::Gradients | WatchMode::All)
    }

    pub fn parameters(self) -> bool {
        matches!(self, WatchMode::Parameters | WatchMode::All)
    }
}

/// Destination for training metrics
pub trait MetricsSink {
    /// Records one step worth of scalar metrics; `metrics` must be a JSON object.
    fn log(&mut self, metrics: Value) -> anyhow::Result<()>;

    /// Records summary statistics for a group of tensors (`gradients` or `parameters`).
    fn log_tensor_stats(&mut self, group: &str, stats: &[TensorStats]) -> anyhow::Result<()>;

    /// Watch mode and reporting interval in optimizer updates, if watching
    fn watching(&self) -> Option<(WatchMode, usize)> {
        None
    }

    /// Called once after the last epoch.
    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
