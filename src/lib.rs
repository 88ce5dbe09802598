//! LoftQ fine-tuning of a quantized Llama classifier for multiple-choice questions
//!
//! This crate tunes low-rank adapters on top of a frozen 4-bit Llama backbone
//! using MLX, with a sequence-classification head that picks one of four options.
//!
//! ## Main Components
//!
//! - `config`: Run hyperparameters, quantization and adapter settings
//! - `data`: Question reading, prompt tokenization and batched loading
//! - `model`: Llama classifier assembly and PEFT adapter I/O
//! - `nn`: Quantized and LoRA-adapted linear layers
//! - `training`: Optimizers, learning rate schedules and the trainer
//! - `tracking`: Local experiment run records
//! - `checkpoints`: Adapter checkpoint management

pub mod checkpoints;
pub mod config;
pub mod data;
pub mod model;
pub mod nn;
pub mod tracking;
pub mod training;
pub mod utils;

pub use config::RunConfig;
pub use training::MultipleChoiceTrainer;

/// Library errors
pub use anyhow::{Error, Result};
