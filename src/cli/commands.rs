//! CLI command implementations

use anyhow::{Context, Result};
use loftq_mc::checkpoints::{CheckpointManager, DEFAULT_MAX_CHECKPOINTS};
use loftq_mc::config::{
    ensure_checkpoint_dir, RunConfig, MAX_SEQ_LENGTH, NUM_CHOICES, TRACKER_PROJECT,
    TRAIN_LOADER_WORKERS, WATCH_LOG_FREQ,
};
use loftq_mc::data::{read_json, DataLoader, MultipleChoiceDataset};
use loftq_mc::model::{
    load_loftq_classifier, print_trainable_parameters, ModelLoader, TokenizerWrapper,
};
use loftq_mc::tracking::{RunTracker, WatchMode};
use loftq_mc::training::{
    get_optimizer, get_scheduler, max_train_steps, warmup_update_steps, MultipleChoiceTrainer,
};
use loftq_mc::utils::{format_param_count, select_device, set_random_seeds};
use std::sync::Arc;

fn print_configuration(config: &RunConfig, total_steps: usize, warmup_steps: usize) {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Training Configuration");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("  Model:          {}", config.base_model_path);
    println!("  Train data:     {}", config.train_data_path.display());
    println!("  Valid data:     {}", config.valid_data_path.display());
    println!("  Batch size:     {}", config.batch_size);
    println!("  Accum steps:    {}", config.accum_grad_step);
    println!("  Epochs:         {}", config.epoch);
    println!("  Optimizer:      {} (lr {}, wd {})", config.optimizer, config.lr, config.weight_decay);
    println!("  LR scheduler:   {} (warmup {} updates)", config.lr_scheduler, warmup_steps);
    println!("  Total updates:  {}", total_steps);
    println!("  LoRA rank:      {}", config.lora_rank);
    println!("  LoftQ bits:     {}", config.nbit);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
}

pub fn train(config: RunConfig) -> Result<()> {
    config.validate()?;
    let checkpoint_dir = ensure_checkpoint_dir(".")?;
    set_random_seeds(config.seed)?;
    let device = select_device(config.device_id);

    let model_dir = ModelLoader::new(config.base_model_path.as_str()).model_dir()?;
    let tokenizer = TokenizerWrapper::from_pretrained(&model_dir)?;
    let pad_token_id = tokenizer.pad_token_id();
    if pad_token_id.is_none() {
        tracing::warn!("Tokenizer in {} defines no padding token", model_dir.display());
    }

    let train_examples = read_json(&config.train_data_path)?;
    let valid_examples = read_json(&config.valid_data_path)?;
    let train_set = MultipleChoiceDataset::new(train_examples, &tokenizer, MAX_SEQ_LENGTH)
        .context("Failed to tokenize training data")?;
    let valid_set = MultipleChoiceDataset::new(valid_examples, &tokenizer, MAX_SEQ_LENGTH)
        .context("Failed to tokenize validation data")?;
    tracing::info!(
        "Loaded {} training and {} validation examples",
        train_set.len(),
        valid_set.len()
    );

    let train_loader = DataLoader::new(Arc::new(train_set), config.batch_size, pad_token_id)?
        .with_shuffle(config.seed)
        .with_workers(TRAIN_LOADER_WORKERS);
    let valid_loader = DataLoader::new(Arc::new(valid_set), 1, pad_token_id)?;

    let (model, _) = load_loftq_classifier(
        &config.base_model_path,
        NUM_CHOICES as i32,
        config.lora_rank,
        config.nbit,
        pad_token_id,
    )?;
    let count = print_trainable_parameters(&model);
    tracing::info!(
        "Training {} of {} parameters",
        format_param_count(count.trainable),
        format_param_count(count.total)
    );

    let optimizer = get_optimizer(&config.optimizer, config.weight_decay)?;
    let total_steps = max_train_steps(config.epoch, train_loader.len(), config.accum_grad_step);
    let warmup_steps = warmup_update_steps(config.warm_up_step, config.accum_grad_step);
    let lr_scheduler = get_scheduler(&config.lr_scheduler, config.lr, warmup_steps, total_steps)?;

    let mut tracker = RunTracker::init(
        TRACKER_PROJECT,
        &config.run_group(),
        &config.tracker_config(),
    )?;
    tracker.watch(WatchMode::All, WATCH_LOG_FREQ);

    print_configuration(&config, total_steps, warmup_steps);

    let manager = CheckpointManager::new(&checkpoint_dir, DEFAULT_MAX_CHECKPOINTS)?;
    let epochs = config.epoch;
    let accum_grad_step = config.accum_grad_step;
    let mut trainer = MultipleChoiceTrainer::new(
        tokenizer,
        model,
        device,
        train_loader,
        valid_loader,
        optimizer,
        accum_grad_step,
        lr_scheduler,
        Box::new(tracker),
    )
    .with_checkpoint_manager(manager)
    .with_run_config(config);

    trainer.fit(epochs)
}
