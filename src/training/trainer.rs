//! Multiple-choice fine-tuning loop
//!
//! One optimizer update is applied per `accum_grad_step` batches (and on the
//! trailing partial group of every epoch). After each epoch the model is
//! evaluated on the validation loader and, when accuracy improves, the
//! adapter weights are checkpointed.

use crate::checkpoints::{AdapterState, Checkpoint, CheckpointManager};
use crate::config::RunConfig;
use crate::data::{Batch, DataLoader};
use crate::model::{adapter_state, LlamaForSequenceClassification, TokenizerWrapper};
use crate::tracking::{MetricsSink, TensorStats};
use crate::training::optimizer::{Gradients, Optimizer};
use crate::training::scheduler::LearningRateScheduler;
use crate::utils::format_duration;
use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use mlx_rs::error::Exception;
use mlx_rs::losses::{CrossEntropyBuilder, LossReduction};
use mlx_rs::module::ModuleParameters;
use mlx_rs::{Array, Device};
use serde_json::json;
use std::time::Instant;

/// Validation result of one epoch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalResult {
    pub loss: f32,
    pub accuracy: f32,
}

pub struct MultipleChoiceTrainer {
    tokenizer: TokenizerWrapper,
    model: LlamaForSequenceClassification,
    device: Device,
    train_loader: DataLoader,
    valid_loader: DataLoader,
    optimizer: Box<dyn Optimizer>,
    accum_grad_step: usize,
    lr_scheduler: Box<dyn LearningRateScheduler>,
    logger: Box<dyn MetricsSink>,
    checkpoint_manager: Option<CheckpointManager>,
    run_config: RunConfig,
    update_count: usize,
    best: Option<(usize, EvalResult)>,
    loss_history: Vec<f32>,
    training_start_time: Option<Instant>,
}

/// Host batch uploaded as `(input_ids [B, L], positions [B], labels [B])`
fn batch_arrays(
    model: &LlamaForSequenceClassification,
    batch: &Batch,
) -> anyhow::Result<(Array, Array, Array)> {
    let positions = model.pooling_positions(&batch.input_ids, batch.batch_size, batch.seq_len)?;
    let rows = batch.batch_size as i32;
    Ok((
        Array::from_slice(&batch.input_ids, &batch.shape()),
        Array::from_slice(&positions, &[rows]),
        Array::from_slice(&batch.labels, &[rows]),
    ))
}

fn accumulate(sum: &mut Option<Gradients>, grads: Gradients) -> Result<(), Exception> {
    match sum {
        None => *sum = Some(grads),
        Some(total) => {
            for (name, grad) in grads {
                let merged = match total.remove(&name) {
                    Some(prev) => prev.add(&grad)?,
                    None => grad,
                };
                merged.eval()?;
                total.insert(name, merged);
            }
        }
    }
    Ok(())
}

/// Index of the largest logit in each `[num_labels]` row
fn argmax_rows(logits: &[f32], num_labels: usize) -> Vec<i32> {
    logits
        .chunks(num_labels.max(1))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 {
                        (i, v)
                    } else {
                        best
                    }
                })
                .0 as i32
        })
        .collect()
}

impl MultipleChoiceTrainer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tokenizer: TokenizerWrapper,
        model: LlamaForSequenceClassification,
        device: Device,
        train_loader: DataLoader,
        valid_loader: DataLoader,
        optimizer: Box<dyn Optimizer>,
        accum_grad_step: usize,
        lr_scheduler: Box<dyn LearningRateScheduler>,
        logger: Box<dyn MetricsSink>,
    ) -> Self {
        Self {
            tokenizer,
            model,
            device,
            train_loader,
            valid_loader,
            optimizer,
            accum_grad_step,
            lr_scheduler,
            logger,
            checkpoint_manager: None,
            run_config: RunConfig::default(),
            update_count: 0,
            best: None,
            loss_history: Vec::new(),
            training_start_time: None,
        }
    }

    /// Enables best-accuracy checkpointing.
    pub fn with_checkpoint_manager(mut self, manager: CheckpointManager) -> Self {
        self.checkpoint_manager = Some(manager);
        self
    }

    /// Hyperparameters embedded in every checkpoint
    pub fn with_run_config(mut self, config: RunConfig) -> Self {
        self.run_config = config;
        self
    }

    pub fn update_count(&self) -> usize {
        self.update_count
    }

    /// Best epoch and its validation result so far
    pub fn best(&self) -> Option<(usize, EvalResult)> {
        self.best
    }

    pub fn model(&self) -> &LlamaForSequenceClassification {
        &self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn fit(&mut self, epochs: usize) -> anyhow::Result<()> {
        let start_time = Instant::now();
        self.training_start_time = Some(start_time);
        self.log_first_validation_prompt();

        for epoch in 0..epochs {
            let train_loss = self.train_epoch(epoch)?;
            let eval = self.evaluate()?;

            tracing::info!(
                "Epoch {}/{}: train_loss={:.4} valid_loss={:.4} valid_acc={:.4}",
                epoch + 1,
                epochs,
                train_loss,
                eval.loss,
                eval.accuracy
            );
            self.logger.log(json!({
                "epoch": epoch,
                "train_loss": train_loss,
                "valid_loss": eval.loss,
                "valid_acc": eval.accuracy,
            }))?;

            let improved = self
                .best
                .map_or(true, |(_, best)| eval.accuracy > best.accuracy);
            if improved {
                self.best = Some((epoch, eval));
                self.save_checkpoint(epoch, eval)?;
            }
        }

        self.print_training_summary();
        self.logger.finish()
    }

    /// Runs one pass over the training loader and returns the mean batch loss.
    fn train_epoch(&mut self, epoch: usize) -> anyhow::Result<f32> {
        let num_batches = self.train_loader.len();
        let pb = ProgressBar::new(num_batches as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ETA:{eta} {msg}")?
                .progress_chars("=>-"),
        );
        pb.set_message(format!("epoch {}", epoch + 1));

        let accum = self.accum_grad_step;
        let ce_loss_fn = CrossEntropyBuilder::new()
            .reduction(LossReduction::Mean)
            .build()?;
        let loss_fn = move |model: &mut LlamaForSequenceClassification,
                            (input_ids, positions, labels): (&Array, &Array, &Array)|
              -> Result<Array, Exception> {
            let logits = model.forward(input_ids, positions)?;
            let loss = ce_loss_fn.apply(&logits, labels)?;
            loss.divide(Array::from_f32(accum as f32))
        };
        let mut vg = mlx_rs::nn::value_and_grad(loss_fn);

        let mut grad_sum: Option<Gradients> = None;
        let mut group_loss = 0.0f32;
        let mut epoch_loss = 0.0f32;

        for (batch_idx, batch) in self.train_loader.iter(epoch).enumerate() {
            let (input_ids, positions, labels) = batch_arrays(&self.model, &batch)?;

            let (loss, grads) = vg(&mut self.model, (&input_ids, &positions, &labels))
                .map_err(|e| anyhow::anyhow!("Gradient computation failed: {}", e))?;
            let loss_val: f32 = loss.item();

            if loss_val.is_nan() || loss_val.is_infinite() {
                pb.abandon();
                anyhow::bail!(
                    "Training diverged: loss is {} at epoch {} batch {}",
                    loss_val,
                    epoch,
                    batch_idx
                );
            }

            accumulate(&mut grad_sum, grads)?;
            group_loss += loss_val;
            epoch_loss += loss_val * accum as f32;

            let last_batch = batch_idx + 1 == num_batches;
            if (batch_idx + 1) % accum == 0 || last_batch {
                if let Some(grads) = grad_sum.take() {
                    self.apply_update(&grads, group_loss)?;
                }
                group_loss = 0.0;
            }

            pb.inc(1);
            pb.set_message(format!(
                "epoch {} | loss {:.4} | updates {}",
                epoch + 1,
                loss_val * accum as f32,
                self.update_count
            ));
        }

        pb.finish_and_clear();
        Ok(epoch_loss / num_batches.max(1) as f32)
    }

    fn apply_update(&mut self, grads: &Gradients, train_loss: f32) -> anyhow::Result<()> {
        let lr = self.lr_scheduler.get_lr(self.update_count);
        {
            let mut params = self.model.parameters_mut().flatten();
            self.optimizer.update(&mut params, grads, lr)?;
        }
        self.update_count += 1;
        self.loss_history.push(train_loss);

        self.logger.log(json!({
            "train_loss": train_loss,
            "lr": lr,
        }))?;

        if let Some((mode, log_freq)) = self.logger.watching() {
            if log_freq > 0 && self.update_count % log_freq == 0 {
                if mode.gradients() {
                    let stats = tensor_stats(grads.iter().map(|(name, g)| (name.as_ref(), g)))?;
                    self.logger.log_tensor_stats("gradients", &stats)?;
                }
                if mode.parameters() {
                    let params = self.model.trainable_parameters().flatten();
                    let stats = tensor_stats(params.iter().map(|(name, p)| (name.as_ref(), *p)))?;
                    self.logger.log_tensor_stats("parameters", &stats)?;
                }
            }
        }

        Ok(())
    }

    /// Mean cross-entropy and accuracy over the validation loader.
    pub fn evaluate(&mut self) -> anyhow::Result<EvalResult> {
        let ce_loss_fn = CrossEntropyBuilder::new()
            .reduction(LossReduction::Sum)
            .build()?;
        let num_labels = self.model.num_labels as usize;

        let mut total_loss = 0.0f32;
        let mut correct = 0usize;
        let mut seen = 0usize;

        for batch in self.valid_loader.iter(0) {
            let (input_ids, positions, labels) = batch_arrays(&self.model, &batch)?;
            let logits = self.model.forward(&input_ids, &positions)?;
            let loss = ce_loss_fn.apply(&logits, &labels)?;
            let loss_val: f32 = loss.item();

            let logits = logits.as_type::<f32>()?;
            logits.eval()?;
            let predictions = argmax_rows(logits.as_slice::<f32>(), num_labels);

            total_loss += loss_val;
            correct += predictions
                .iter()
                .zip(&batch.labels)
                .filter(|(p, l)| p == l)
                .count();
            seen += batch.batch_size;
        }

        if seen == 0 {
            return Ok(EvalResult {
                loss: 0.0,
                accuracy: 0.0,
            });
        }
        Ok(EvalResult {
            loss: total_loss / seen as f32,
            accuracy: correct as f32 / seen as f32,
        })
    }

    fn save_checkpoint(&mut self, epoch: usize, eval: EvalResult) -> anyhow::Result<()> {
        let Some(manager) = &self.checkpoint_manager else {
            return Ok(());
        };

        let state = AdapterState::from_arrays(adapter_state(&self.model))?;
        let checkpoint = Checkpoint::new(
            epoch,
            self.update_count,
            eval.accuracy,
            eval.loss,
            self.run_config.clone(),
            state,
        );
        let path = manager
            .save(&checkpoint)
            .with_context(|| format!("Failed to save checkpoint for epoch {}", epoch))?;
        manager.save_best(&checkpoint)?;
        tracing::info!(
            "Validation accuracy improved to {:.4}, saved {}",
            eval.accuracy,
            path.display()
        );
        Ok(())
    }

    fn log_first_validation_prompt(&self) {
        let Some(batch) = self.valid_loader.iter(0).next() else {
            return;
        };
        let len = batch.lengths.first().copied().unwrap_or(0);
        let ids: Vec<u32> = batch.input_ids[..len].iter().map(|&id| id as u32).collect();
        match self.tokenizer.decode(&ids, false) {
            Ok(text) => tracing::debug!("First validation prompt: {}", text),
            Err(e) => tracing::debug!("Could not decode first validation prompt: {}", e),
        }
    }

    fn print_training_summary(&self) {
        println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        println!("Training Complete");
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if let Some(start_time) = self.training_start_time {
            println!(
                "  Duration:       {}",
                format_duration(start_time.elapsed().as_secs())
            );
        }
        println!("  Updates:        {}", self.update_count);

        if let (Some(first), Some(last)) = (self.loss_history.first(), self.loss_history.last()) {
            println!("  Initial loss:   {:.4}", first);
            println!("  Final loss:     {:.4}", last);
        }
        if let Some((epoch, eval)) = self.best {
            println!(
                "  Best valid acc: {:.4} (epoch {}, loss {:.4})",
                eval.accuracy,
                epoch + 1,
                eval.loss
            );
            if let Some(manager) = &self.checkpoint_manager {
                println!("  Best checkpoint: {}", manager.best_path().display());
            }
        }

        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");
    }
}

fn tensor_stats<'a>(
    tensors: impl Iterator<Item = (&'a str, &'a Array)>,
) -> anyhow::Result<Vec<TensorStats>> {
    let mut stats = tensors
        .map(|(name, array)| TensorStats::from_array(name, array))
        .collect::<anyhow::Result<Vec<_>>>()?;
    stats.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(stats)
}
