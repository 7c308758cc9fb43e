//! Adam with per-group learning rates, and a multi-step LR schedule.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use crate::error::{TrainError, TrainResult};
use crate::model::{Component, ModelParams};

const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;
const EPS: f64 = 1e-8;

struct AdamSlot {
    name: String,
    var: Var,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
    steps: usize,
}

/// Parameters sharing one learning rate.
pub struct ParamGroup {
    name: &'static str,
    base_lr: f64,
    lr: f64,
    slots: Vec<AdamSlot>,
}

impl ParamGroup {
    fn new(name: &'static str, lr: f64, vars: Vec<(String, Var)>) -> TrainResult<Self> {
        let slots = vars
            .into_iter()
            .map(|(name, var)| {
                Ok(AdamSlot {
                    exp_avg: var.zeros_like()?,
                    exp_avg_sq: var.zeros_like()?,
                    name,
                    var,
                    steps: 0,
                })
            })
            .collect::<TrainResult<Vec<_>>>()?;
        Ok(Self {
            name,
            base_lr: lr,
            lr,
            slots,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Adam over the encoder/head group and the propagation group.
///
/// Parameters without a gradient in a step are left alone, their moments
/// included.
pub struct GroupedAdam {
    groups: Vec<ParamGroup>,
    steps: usize,
}

impl GroupedAdam {
    pub fn new(params: &ModelParams, encoder_lr: f64, propagation_lr: f64) -> TrainResult<Self> {
        if encoder_lr <= 0.0 || propagation_lr <= 0.0 {
            return Err(TrainError::Config(format!(
                "learning rates must be positive (encoder={}, propagation={})",
                encoder_lr, propagation_lr
            )));
        }
        let mut encoder_vars = prefixed(params, Component::Encoder)?;
        encoder_vars.extend(prefixed(params, Component::Classifier)?);
        Ok(Self {
            groups: vec![
                ParamGroup::new("encoder", encoder_lr, encoder_vars)?,
                ParamGroup::new(
                    "propagation",
                    propagation_lr,
                    prefixed(params, Component::Propagation)?,
                )?,
            ],
            steps: 0,
        })
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// Number of optimizer steps taken.
    pub fn step_count(&self) -> usize {
        self.steps
    }

    pub fn step(&mut self, grads: &GradStore) -> TrainResult<()> {
        self.steps += 1;
        for group in &mut self.groups {
            for slot in &mut group.slots {
                let Some(grad) = grads.get(slot.var.as_tensor()) else {
                    continue;
                };
                slot.steps += 1;
                let t = slot.steps as i32;
                let bias1 = 1.0 - BETA1.powi(t);
                let bias2 = 1.0 - BETA2.powi(t);

                // Moments must not keep the backward graph alive between steps
                let grad = grad.detach();
                slot.exp_avg =
                    (slot.exp_avg.affine(BETA1, 0.0)? + grad.affine(1.0 - BETA1, 0.0)?)?.detach();
                slot.exp_avg_sq = (slot.exp_avg_sq.affine(BETA2, 0.0)?
                    + grad.sqr()?.affine(1.0 - BETA2, 0.0)?)?
                .detach();

                let m_hat = slot.exp_avg.affine(1.0 / bias1, 0.0)?;
                let v_hat = slot.exp_avg_sq.affine(1.0 / bias2, 0.0)?;
                let update = (m_hat / v_hat.sqrt()?.affine(1.0, EPS)?)?.affine(group.lr, 0.0)?;
                slot.var.set(&slot.var.as_tensor().sub(&update)?)?;
            }
        }
        Ok(())
    }

    /// Set every group's rate to `factor` times its initial rate.
    pub fn scale_learning_rates(&mut self, factor: f64) {
        for group in &mut self.groups {
            group.lr = group.base_lr * factor;
        }
    }

    /// Moment tensors keyed `optimizer.<group>.<param>.exp_avg[_sq]`.
    pub fn state_tensors(&self) -> Vec<(String, Tensor)> {
        let mut out = Vec::new();
        for group in &self.groups {
            for slot in &group.slots {
                let key = format!("optimizer.{}.{}", group.name, slot.name);
                out.push((format!("{}.exp_avg", key), slot.exp_avg.clone()));
                out.push((format!("{}.exp_avg_sq", key), slot.exp_avg_sq.clone()));
            }
        }
        out
    }
}

fn prefixed(params: &ModelParams, component: Component) -> TrainResult<Vec<(String, Var)>> {
    Ok(params
        .named_vars(component)?
        .into_iter()
        .map(|(name, var)| (format!("{}.{}", component.prefix(), name), var))
        .collect())
}

// ============================================================================
// LR schedule
// ============================================================================

/// Multiply the base rate by `gamma` once for every milestone epoch passed.
#[derive(Debug, Clone)]
pub struct MultiStepLr {
    milestones: Vec<usize>,
    gamma: f64,
    last_epoch: usize,
}

impl MultiStepLr {
    pub fn new(mut milestones: Vec<usize>, gamma: f64) -> TrainResult<Self> {
        if !(gamma > 0.0 && gamma <= 1.0) {
            return Err(TrainError::Config(format!(
                "lr_gamma must be within (0, 1], got {}",
                gamma
            )));
        }
        milestones.sort_unstable();
        Ok(Self {
            milestones,
            gamma,
            last_epoch: 0,
        })
    }

    /// Number of completed epochs the schedule has seen.
    pub fn last_epoch(&self) -> usize {
        self.last_epoch
    }

    /// Current multiplier on the base learning rates.
    pub fn factor(&self) -> f64 {
        let passed = self
            .milestones
            .iter()
            .filter(|&&m| m <= self.last_epoch)
            .count();
        self.gamma.powi(passed as i32)
    }

    /// Advance one epoch and apply the new factor.
    pub fn step(&mut self, optimizer: &mut GroupedAdam) -> f64 {
        self.last_epoch += 1;
        let factor = self.factor();
        optimizer.scale_learning_rates(factor);
        factor
    }
}
