//! Optimizers selected by name
//!
//! Each optimizer updates the flattened trainable parameters in place from
//! gradients keyed by the same names.

use crate::config::ConfigError;
use mlx_rs::Array;
use std::collections::HashMap;
use std::rc::Rc;

pub type Gradients = HashMap<Rc<str>, Array>;
pub type ParametersMut<'a> = HashMap<Rc<str>, &'a mut Array>;

pub trait Optimizer {
    fn name(&self) -> &'static str;

    fn update(&mut self, params: &mut ParametersMut<'_>, grads: &Gradients, lr: f32)
        -> anyhow::Result<()>;

    /// Number of updates applied so far
    fn step_count(&self) -> usize;
}

pub fn get_optimizer(
    name: &str,
    weight_decay: f32,
) -> Result<Box<dyn Optimizer>, ConfigError> {
    match name {
        "adamw" => Ok(Box::new(AdamW::new(weight_decay))),
        "adam" => Ok(Box::new(Adam::new(weight_decay))),
        "sgd" => Ok(Box::new(Sgd::new(weight_decay))),
        other => Err(ConfigError::UnknownOptimizer(other.to_string())),
    }
}

#[derive(Debug, Clone, Copy)]
struct Betas {
    beta1: f32,
    beta2: f32,
    eps: f32,
}

impl Default for Betas {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// First and second moment estimates shared by Adam and AdamW
#[derive(Default)]
struct Moments {
    m: HashMap<Rc<str>, Array>,
    v: HashMap<Rc<str>, Array>,
    step: usize,
}

impl Moments {
    /// Bias-corrected `lr * m_hat / (sqrt(v_hat) + eps)` for one parameter.
    fn scaled_update(
        &mut self,
        name: &Rc<str>,
        grad: &Array,
        lr: f32,
        betas: Betas,
    ) -> Result<Array, mlx_rs::error::Exception> {
        let t = self.step as f32;
        let bias_correction1 = 1.0 - betas.beta1.powf(t);
        let bias_correction2 = 1.0 - betas.beta2.powf(t);

        // m = beta1 * m_prev + (1-beta1) * g
        let m_new = match self.m.get(name) {
            Some(m) => m
                .multiply(Array::from_f32(betas.beta1))?
                .add(&grad.multiply(Array::from_f32(1.0 - betas.beta1))?)?,
            None => grad.multiply(Array::from_f32(1.0 - betas.beta1))?,
        };

        // v = beta2 * v_prev + (1-beta2) * g^2
        let g_sq = grad.multiply(grad)?;
        let v_new = match self.v.get(name) {
            Some(v) => v
                .multiply(Array::from_f32(betas.beta2))?
                .add(&g_sq.multiply(Array::from_f32(1.0 - betas.beta2))?)?,
            None => g_sq.multiply(Array::from_f32(1.0 - betas.beta2))?,
        };

        let m_hat = m_new.multiply(Array::from_f32(1.0 / bias_correction1))?;
        let v_hat_sqrt = v_new
            .multiply(Array::from_f32(1.0 / bias_correction2))?
            .sqrt()?;
        let update = m_hat
            .multiply(Array::from_f32(lr))?
            .divide(&v_hat_sqrt.add(Array::from_f32(betas.eps))?)?;

        m_new.eval()?;
        v_new.eval()?;
        self.m.insert(name.clone(), m_new);
        self.v.insert(name.clone(), v_new);
        Ok(update)
    }
}

/// Adam with decoupled weight decay
pub struct AdamW {
    weight_decay: f32,
    betas: Betas,
    moments: Moments,
}

impl AdamW {
    pub fn new(weight_decay: f32) -> Self {
        Self {
            weight_decay,
            betas: Betas::default(),
            moments: Moments::default(),
        }
    }
}

impl Optimizer for AdamW {
    fn name(&self) -> &'static str {
        "adamw"
    }

    fn update(
        &mut self,
        params: &mut ParametersMut<'_>,
        grads: &Gradients,
        lr: f32,
    ) -> anyhow::Result<()> {
        self.moments.step += 1;
        for (name, grad) in grads {
            let Some(p) = params.get_mut(name) else {
                continue;
            };
            let update = self.moments.scaled_update(name, grad, lr, self.betas)?;

            // new_p = p * (1 - lr*wd) - update
            let decay_factor = Array::from_f32(1.0 - lr * self.weight_decay);
            let new_param = (**p).multiply(&decay_factor)?.subtract(&update)?;
            new_param.eval()?;
            **p = new_param;
        }
        Ok(())
    }

    fn step_count(&self) -> usize {
        self.moments.step
    }
}

/// Adam with classic L2 regularization folded into the gradient
pub struct Adam {
    weight_decay: f32,
    betas: Betas,
    moments: Moments,
}

impl Adam {
    pub fn new(weight_decay: f32) -> Self {
        Self {
            weight_decay,
            betas: Betas::default(),
            moments: Moments::default(),
        }
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &'static str {
        "adam"
    }

    fn update(
        &mut self,
        params: &mut ParametersMut<'_>,
        grads: &Gradients,
        lr: f32,
    ) -> anyhow::Result<()> {
        self.moments.step += 1;
        for (name, grad) in grads {
            let Some(p) = params.get_mut(name) else {
                continue;
            };
            let grad = if self.weight_decay != 0.0 {
                grad.add(&(**p).multiply(Array::from_f32(self.weight_decay))?)?
            } else {
                grad.clone()
            };
            let update = self.moments.scaled_update(name, &grad, lr, self.betas)?;
            let new_param = (**p).subtract(&update)?;
            new_param.eval()?;
            **p = new_param;
        }
        Ok(())
    }

    fn step_count(&self) -> usize {
        self.moments.step
    }
}

/// Plain stochastic gradient descent
pub struct Sgd {
    weight_decay: f32,
    step: usize,
}

impl Sgd {
    pub fn new(weight_decay: f32) -> Self {
        Self {
            weight_decay,
            step: 0,
        }
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn update(
        &mut self,
        params: &mut ParametersMut<'_>,
        grads: &Gradients,
        lr: f32,
    ) -> anyhow::Result<()> {
        self.step += 1;
        for (name, grad) in grads {
            let Some(p) = params.get_mut(name) else {
                continue;
            };
            let mut direction = grad.clone();
            if self.weight_decay != 0.0 {
                direction = direction.add(&(**p).multiply(Array::from_f32(self.weight_decay))?)?;
            }
            let new_param = (**p).subtract(&direction.multiply(Array::from_f32(lr))?)?;
            new_param.eval()?;
            **p = new_param;
        }
        Ok(())
    }

    fn step_count(&self) -> usize {
        self.step
    }
}
