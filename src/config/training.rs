use super::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};

/// Hyperparameters of one fine-tuning run
///
/// Built once from the command line and never mutated afterwards. The
/// same record is written to the tracker and embedded in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub base_model_path: String,
    pub train_data_path: PathBuf,
    pub valid_data_path: PathBuf,
    pub batch_size: usize,
    pub accum_grad_step: usize,
    pub epoch: usize,
    pub optimizer: String,
    pub lr: f32,
    pub weight_decay: f32,
    pub lr_scheduler: String,
    pub warm_up_step: usize,
    pub device_id: usize,
    pub lora_rank: usize,
    pub nbit: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_seed() -> u64 {
    42
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            base_model_path: "model_weight/Taiwan-LLM-7B-v2.0-chat".to_string(),
            train_data_path: PathBuf::from("data/train_data/train.json"),
            valid_data_path: PathBuf::from("data/train_data/valid.json"),
            batch_size: 8,
            accum_grad_step: 2,
            epoch: 100,
            optimizer: "adamw".to_string(),
            lr: 2e-4,
            weight_decay: 0.0,
            lr_scheduler: "constant".to_string(),
            warm_up_step: 0,
            device_id: 0,
            lora_rank: 8,
            nbit: 2,
            seed: default_seed(),
        }
    }
}

impl RunConfig {
    /// Rejects values the step arithmetic cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroValue("batch_size"));
        }
        if self.accum_grad_step == 0 {
            return Err(ConfigError::ZeroValue("accum_grad_step"));
        }
        Ok(())
    }

    /// Tracker group, e.g. `LoftQ-LLM-MC-train-valid`
    pub fn run_group(&self) -> String {
        format!(
            "LoftQ-LLM-MC-{}-{}",
            file_stem(&self.train_data_path),
            file_stem(&self.valid_data_path)
        )
    }

    /// Hyperparameter record mirrored into the tracker.
    pub fn tracker_config(&self) -> serde_json::Value {
        json!({
            "tokenizer": self.base_model_path,
            "model": self.base_model_path,
            "epoch": self.epoch,
            "batch_size": self.batch_size,
            "accum_grad_step": self.accum_grad_step,
            "optimizer": self.optimizer,
            "lr_scheduler": self.lr_scheduler,
            "lr": self.lr,
            "weight_decay": self.weight_decay,
            "warm_up_step": self.warm_up_step,
            "lora_rank": self.lora_rank,
            "nbit": self.nbit,
        })
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_group_uses_file_stems() {
        let config = RunConfig {
            train_data_path: PathBuf::from("data/split/train_83_109.json"),
            valid_data_path: PathBuf::from("/abs/valid_110.json"),
            ..Default::default()
        };
        assert_eq!(config.run_group(), "LoftQ-LLM-MC-train_83_109-valid_110");
    }

    #[test]
    fn test_tracker_config_mirrors_fields() {
        let config = RunConfig::default();
        let record = config.tracker_config();
        assert_eq!(record["model"], "model_weight/Taiwan-LLM-7B-v2.0-chat");
        assert_eq!(record["tokenizer"], record["model"]);
        assert_eq!(record["accum_grad_step"], 2);
        assert_eq!(record["nbit"], 2);
        assert_eq!(record.as_object().unwrap().len(), 12);
    }

    #[test]
    fn test_zero_accumulation_is_rejected() {
        assert!(RunConfig::default().validate().is_ok());

        let config = RunConfig {
            accum_grad_step: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err, ConfigError::ZeroValue("accum_grad_step"));
        assert_eq!(err.to_string(), "accum_grad_step must be at least 1");
    }

    #[test]
    fn test_missing_seed_defaults_to_42() {
        let mut value = serde_json::to_value(RunConfig::default()).unwrap();
        value.as_object_mut().unwrap().remove("seed");
        let config: RunConfig = serde_json::from_value(value).unwrap();
        assert_eq!(config.seed, 42);
    }
}
