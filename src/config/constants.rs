//! Project-wide constants shared by the training and evaluation entry points.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use super::ConfigError;

/// Directory that receives adapter checkpoints.
pub const CHECKPOINT_DIR: &str = "checkpoint";

/// Exam folders used for training data.
pub const TRAIN_FOLDERS: &[&str] = &[
    "83", "84", "85", "86", "87", "88", "89", "90", "91", "91_bu", "92", "92_bu", "93", "94",
    "95", "96", "97", "98", "99", "100", "101", "102", "103", "104", "105", "106", "107", "108",
    "109",
];

/// Exam folders held out for validation.
pub const VALID_FOLDERS: &[&str] = &["110", "111", "112"];

/// Number of answer options per question.
pub const NUM_CHOICES: usize = 4;

/// Token budget per tokenized example.
pub const MAX_SEQ_LENGTH: usize = 1024;

/// Experiment-tracking project that receives every run.
pub const TRACKER_PROJECT: &str = "adl_final_project";

/// Optimizer updates between gradient/parameter reports.
pub const WATCH_LOG_FREQ: usize = 1000;

/// Collation threads behind the training loader.
pub const TRAIN_LOADER_WORKERS: usize = 2;

/// How a model is asked to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskMode {
    ZeroShot,
    FewShot,
    LoraFineTune,
}

impl TaskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskMode::ZeroShot => "zero-shot",
            TaskMode::FewShot => "few-shot",
            TaskMode::LoraFineTune => "lora-fine-tune",
        }
    }
}

impl fmt::Display for TaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zero-shot" => Ok(TaskMode::ZeroShot),
            "few-shot" => Ok(TaskMode::FewShot),
            "lora-fine-tune" => Ok(TaskMode::LoraFineTune),
            other => Err(ConfigError::UnknownTaskMode(other.to_string())),
        }
    }
}

/// Creates the checkpoint directory under `root` if it does not exist yet.
///
/// Called once at process start, before any trainer is built.
pub fn ensure_checkpoint_dir(root: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let dir = root.as_ref().join(CHECKPOINT_DIR);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create checkpoint directory {}", dir.display()))?;
    Ok(dir)
}
