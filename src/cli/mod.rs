pub mod commands;

use anyhow::Result;
use clap::Parser;
use loftq_mc::config::RunConfig;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "train_loftq_mc")]
#[command(
    about = "Fine-tune a 4-bit quantized Llama classifier with LoftQ adapters on multiple-choice questions",
    long_about = None
)]
pub struct Args {
    /// Base model directory or HuggingFace name
    #[arg(long = "base_model_path", default_value = "model_weight/Taiwan-LLM-7B-v2.0-chat")]
    pub base_model_path: String,

    #[arg(long = "train_data_path", default_value = "data/train_data/train.json")]
    pub train_data_path: PathBuf,

    #[arg(long = "valid_data_path", default_value = "data/train_data/valid.json")]
    pub valid_data_path: PathBuf,

    #[arg(long = "batch_size", default_value_t = 8)]
    pub batch_size: usize,

    /// Batches per optimizer update
    #[arg(long = "accum_grad_step", default_value_t = 2)]
    pub accum_grad_step: usize,

    #[arg(long = "epoch", default_value_t = 100)]
    pub epoch: usize,

    /// adamw, adam or sgd
    #[arg(long = "optimizer", default_value = "adamw")]
    pub optimizer: String,

    #[arg(long = "lr", default_value_t = 2e-4)]
    pub lr: f32,

    #[arg(long = "weight_decay", default_value_t = 0.0)]
    pub weight_decay: f32,

    /// linear, constant, constant_with_warmup, cosine or cosine_warmup
    #[arg(long = "lr_scheduler", default_value = "constant")]
    pub lr_scheduler: String,

    /// Warmup length in batches
    #[arg(long = "warm_up_step", default_value_t = 0)]
    pub warm_up_step: usize,

    #[arg(long = "device_id", default_value_t = 0)]
    pub device_id: usize,

    #[arg(long = "lora_rank", default_value_t = 8)]
    pub lora_rank: usize,

    /// Bit width the LoftQ adapter was initialized for
    #[arg(long = "nbit", default_value_t = 2)]
    pub nbit: usize,
}

impl Args {
    pub fn into_run_config(self) -> RunConfig {
        RunConfig {
            base_model_path: self.base_model_path,
            train_data_path: self.train_data_path,
            valid_data_path: self.valid_data_path,
            batch_size: self.batch_size,
            accum_grad_step: self.accum_grad_step,
            epoch: self.epoch,
            optimizer: self.optimizer,
            lr: self.lr,
            weight_decay: self.weight_decay,
            lr_scheduler: self.lr_scheduler,
            warm_up_step: self.warm_up_step,
            device_id: self.device_id,
            lora_rank: self.lora_rank,
            nbit: self.nbit,
            ..RunConfig::default()
        }
    }
}

pub fn run() -> Result<()> {
    let args = Args::parse();
    commands::train(args.into_run_config())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_run_config() {
        let args = Args::try_parse_from(["train_loftq_mc"]).unwrap();
        assert_eq!(args.into_run_config(), RunConfig::default());
    }

    #[test]
    fn test_overrides_use_snake_case_flags() {
        let args = Args::try_parse_from([
            "train_loftq_mc",
            "--batch_size",
            "16",
            "--accum_grad_step",
            "4",
            "--lr_scheduler",
            "cosine_warmup",
            "--warm_up_step",
            "100",
            "--lr",
            "1e-4",
            "--train_data_path",
            "data/split/train_83.json",
        ])
        .unwrap();
        let config = args.into_run_config();
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.accum_grad_step, 4);
        assert_eq!(config.lr_scheduler, "cosine_warmup");
        assert_eq!(config.warm_up_step, 100);
        assert!((config.lr - 1e-4).abs() < 1e-12);
        assert_eq!(config.train_data_path, PathBuf::from("data/split/train_83.json"));
        assert_eq!(config.epoch, 100);
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        assert!(Args::try_parse_from(["train_loftq_mc", "--batch_size", "eight"]).is_err());
        assert!(Args::try_parse_from(["train_loftq_mc", "--batch-size", "8"]).is_err());
    }
}
