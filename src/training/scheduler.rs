//! Learning rate schedules selected by name

use crate::config::ConfigError;
use std::f32::consts::PI;
use std::str::FromStr;

pub trait LearningRateScheduler {
    /// Learning rate for the optimizer update with index `step` (0-based)
    fn get_lr(&self, step: usize) -> f32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Linear,
    Constant,
    ConstantWithWarmup,
    Cosine,
}

impl FromStr for ScheduleKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Self::Linear),
            "constant" => Ok(Self::Constant),
            "constant_with_warmup" => Ok(Self::ConstantWithWarmup),
            "cosine" | "cosine_warmup" => Ok(Self::Cosine),
            other => Err(ConfigError::UnknownScheduler(other.to_string())),
        }
    }
}

/// `base_lr` scaled by a warmup/decay factor in [0, 1]
#[derive(Debug, Clone)]
pub struct Schedule {
    kind: ScheduleKind,
    base_lr: f32,
    warmup_steps: usize,
    total_steps: usize,
}

impl Schedule {
    pub fn new(kind: ScheduleKind, base_lr: f32, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps,
        }
    }

    fn warmup_factor(&self, step: usize) -> Option<f32> {
        if step < self.warmup_steps {
            Some(step as f32 / self.warmup_steps.max(1) as f32)
        } else {
            None
        }
    }

    fn progress(&self, step: usize) -> f32 {
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        (step - self.warmup_steps) as f32 / decay_steps as f32
    }

    pub fn factor(&self, step: usize) -> f32 {
        match self.kind {
            ScheduleKind::Constant => 1.0,
            ScheduleKind::ConstantWithWarmup => self.warmup_factor(step).unwrap_or(1.0),
            ScheduleKind::Linear => self.warmup_factor(step).unwrap_or_else(|| {
                let remaining = self.total_steps.saturating_sub(step) as f32;
                let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
                (remaining / decay_steps as f32).max(0.0)
            }),
            ScheduleKind::Cosine => self.warmup_factor(step).unwrap_or_else(|| {
                let progress = self.progress(step).min(1.0);
                (0.5 * (1.0 + (PI * progress).cos())).max(0.0)
            }),
        }
    }
}

impl LearningRateScheduler for Schedule {
    fn get_lr(&self, step: usize) -> f32 {
        self.base_lr * self.factor(step)
    }
}

/// Builds the named schedule; `cosine_warmup` is cosine with warmup.
pub fn get_scheduler(
    name: &str,
    base_lr: f32,
    num_warmup_steps: usize,
    num_training_steps: usize,
) -> Result<Box<dyn LearningRateScheduler>, ConfigError> {
    let kind = name.parse::<ScheduleKind>()?;
    Ok(Box::new(Schedule::new(
        kind,
        base_lr,
        num_warmup_steps,
        num_training_steps,
    )))
}

/// Optimizer updates per epoch: the last partial accumulation group still steps.
///
/// `accum_grad_step` must be nonzero.
pub fn num_update_steps_per_epoch(num_batches: usize, accum_grad_step: usize) -> usize {
    num_batches.div_ceil(accum_grad_step)
}

pub fn max_train_steps(epochs: usize, num_batches: usize, accum_grad_step: usize) -> usize {
    epochs * num_update_steps_per_epoch(num_batches, accum_grad_step)
}

/// Warmup is given in batches on the command line and converted to updates.
pub fn warmup_update_steps(warm_up_step: usize, accum_grad_step: usize) -> usize {
    warm_up_step.div_ceil(accum_grad_step)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-7
    }

    #[test]
    fn test_update_step_arithmetic() {
        assert_eq!(num_update_steps_per_epoch(50, 2), 25);
        assert_eq!(num_update_steps_per_epoch(51, 2), 26);
        assert_eq!(max_train_steps(100, 50, 2), 2500);
        assert_eq!(warmup_update_steps(0, 2), 0);
        assert_eq!(warmup_update_steps(5, 2), 3);
    }

    #[test]
    fn test_constant_ignores_warmup() {
        let schedule = get_scheduler("constant", 2e-4, 10, 100).unwrap();
        assert!(approx(schedule.get_lr(0), 2e-4));
        assert!(approx(schedule.get_lr(99), 2e-4));
    }

    #[test]
    fn test_constant_with_warmup_ramps_then_holds() {
        let schedule = get_scheduler("constant_with_warmup", 1e-3, 4, 100).unwrap();
        assert!(approx(schedule.get_lr(0), 0.0));
        assert!(approx(schedule.get_lr(2), 5e-4));
        assert!(approx(schedule.get_lr(4), 1e-3));
        assert!(approx(schedule.get_lr(80), 1e-3));
    }

    #[test]
    fn test_linear_decays_to_zero() {
        let schedule = get_scheduler("linear", 1e-3, 10, 110).unwrap();
        assert!(approx(schedule.get_lr(5), 5e-4));
        assert!(approx(schedule.get_lr(10), 1e-3));
        assert!(approx(schedule.get_lr(60), 5e-4));
        assert!(approx(schedule.get_lr(110), 0.0));
    }

    #[test]
    fn test_cosine_warmup_is_cosine_with_warmup() {
        let cosine = get_scheduler("cosine", 1e-3, 10, 110).unwrap();
        let alias = get_scheduler("cosine_warmup", 1e-3, 10, 110).unwrap();
        for step in [0, 5, 10, 60, 109] {
            assert!(approx(cosine.get_lr(step), alias.get_lr(step)));
        }
        assert!(approx(cosine.get_lr(60), 5e-4));
        assert!(cosine.get_lr(109) < 1e-5);
    }

    #[test]
    fn test_unknown_scheduler_is_rejected() {
        let err = get_scheduler("polynomial", 1e-3, 0, 10).err().unwrap();
        assert_eq!(err, ConfigError::UnknownScheduler("polynomial".into()));
    }
}
