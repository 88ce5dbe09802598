pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use optimizer::{get_optimizer, Adam, AdamW, Gradients, Optimizer, Sgd};
pub use scheduler::{
    get_scheduler, max_train_steps, num_update_steps_per_epoch, warmup_update_steps,
    LearningRateScheduler, Schedule, ScheduleKind,
};
pub use trainer::{EvalResult, MultipleChoiceTrainer};
