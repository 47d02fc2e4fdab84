//! AdamW optimizer and per-step learning-rate schedules.
//!
//! Optimizer state is keyed by parameter name so it can be checkpointed next
//! to the model state dict and restored into a freshly built model.
//!
//! ## AdamW update (per parameter)
//! ```text
//! p ← p (1 - lr λ)
//! m ← β1 m + (1 - β1) g          v ← β2 v + (1 - β2) g²
//! p ← p - lr (m / (1 - β1^t)) / (sqrt(v / (1 - β2^t)) + ε)
//! ```
//! `λ` is zero for backbone and prior biases and normalization parameters.
//! Subject projection parameters form their own group and are always decayed.

use crate::core::model::BrainModel;
use crate::core::{Gradients, NeuroError, NeuroResult, TensorRecord};
use ndarray::{ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_BETAS: (f32, f32) = (0.9, 0.999);
pub const DEFAULT_EPS: f32 = 1e-8;
pub const DEFAULT_WEIGHT_DECAY: f32 = 1e-2;

/// Prefix of the subject projection parameters.
pub const PROJECTION_PREFIX: &str = "ridge.";

/// Whether a parameter is excluded from weight decay.
pub fn is_no_decay(name: &str) -> bool {
    !name.starts_with(PROJECTION_PREFIX) && (name.ends_with(".bias") || name.contains("norm"))
}

#[derive(Debug, Clone, PartialEq)]
struct Moments {
    step: u64,
    m: ArrayD<f32>,
    v: ArrayD<f32>,
}

/// Serializable moment estimates of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentState {
    pub step: u64,
    pub m: TensorRecord,
    pub v: TensorRecord,
}

/// Serializable optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub lr: f32,
    pub betas: (f32, f32),
    pub eps: f32,
    pub weight_decay: f32,
    /// Number of optimizer steps taken
    pub step: u64,
    pub moments: BTreeMap<String, MomentState>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdamW {
    pub lr: f32,
    pub betas: (f32, f32),
    pub eps: f32,
    pub weight_decay: f32,
    step: u64,
    moments: BTreeMap<String, Moments>,
}

impl AdamW {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            betas: DEFAULT_BETAS,
            eps: DEFAULT_EPS,
            weight_decay: DEFAULT_WEIGHT_DECAY,
            step: 0,
            moments: BTreeMap::new(),
        }
    }

    /// Number of optimizer steps taken.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Apply one update to every model parameter that has a gradient.
    ///
    /// Shapes are checked for every parameter before any is touched, so a
    /// failed step leaves both the model and the optimizer unchanged.
    ///
    /// # Errors
    /// - `ShapeMismatch` if a gradient or stored moment differs from its parameter
    pub fn step(&mut self, model: &mut BrainModel, grads: &Gradients) -> NeuroResult<()> {
        self.check_shapes(model, grads)?;

        let (beta1, beta2) = self.betas;
        let (lr, eps, weight_decay) = (self.lr, self.eps, self.weight_decay);
        let moments = &mut self.moments;

        model.visit_parameters_mut(&mut |name, mut param| {
            let Some(grad) = grads.get(name) else {
                return;
            };
            let state = moments.entry(name.to_string()).or_insert_with(|| Moments {
                step: 0,
                m: ArrayD::zeros(IxDyn(grad.shape())),
                v: ArrayD::zeros(IxDyn(grad.shape())),
            });
            state.step += 1;
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let t = state.step.min(i32::MAX as u64) as i32;
            let bias1 = 1.0 - beta1.powi(t);
            let bias2 = 1.0 - beta2.powi(t);
            let decay = if is_no_decay(name) { 0.0 } else { weight_decay };

            Zip::from(&mut param)
                .and(&mut state.m)
                .and(&mut state.v)
                .and(grad)
                .for_each(|p, m, v, &g| {
                    *p *= 1.0 - lr * decay;
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        });

        self.step += 1;
        Ok(())
    }

    fn check_shapes(&self, model: &BrainModel, grads: &Gradients) -> NeuroResult<()> {
        for (name, param) in model.named_parameters() {
            let Some(grad) = grads.get(&name) else {
                continue;
            };
            if grad.shape() != param.shape() {
                return Err(NeuroError::ShapeMismatch(format!(
                    "{name}: gradient {:?}, parameter {:?}",
                    grad.shape(),
                    param.shape()
                )));
            }
            if let Some(state) = self.moments.get(&name) {
                if state.m.shape() != param.shape() || state.v.shape() != param.shape() {
                    return Err(NeuroError::ShapeMismatch(format!(
                        "{name}: optimizer moments {:?}, parameter {:?}",
                        state.m.shape(),
                        param.shape()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            lr: self.lr,
            betas: self.betas,
            eps: self.eps,
            weight_decay: self.weight_decay,
            step: self.step,
            moments: self
                .moments
                .iter()
                .map(|(name, mom)| {
                    let record = MomentState {
                        step: mom.step,
                        m: TensorRecord::from_view(&mom.m.view()),
                        v: TensorRecord::from_view(&mom.v.view()),
                    };
                    (name.clone(), record)
                })
                .collect(),
        }
    }

    /// Replace this optimizer's state.
    ///
    /// # Errors
    /// - `Format` if a stored moment tensor is malformed
    pub fn load_state(&mut self, state: &OptimizerState) -> NeuroResult<()> {
        let moments = state
            .moments
            .iter()
            .map(|(name, record)| {
                Ok((
                    name.clone(),
                    Moments {
                        step: record.step,
                        m: record.m.to_array()?,
                        v: record.v.to_array()?,
                    },
                ))
            })
            .collect::<NeuroResult<BTreeMap<_, _>>>()?;
        self.lr = state.lr;
        self.betas = state.betas;
        self.eps = state.eps;
        self.weight_decay = state.weight_decay;
        self.step = state.step;
        self.moments = moments;
        Ok(())
    }
}

// ============================================================================
// Learning-rate schedules
// ============================================================================

/// Default starting factor of the linear schedule.
pub const LINEAR_START_FACTOR: f32 = 1.0 / 3.0;
pub const ONE_CYCLE_DIV_FACTOR: f32 = 25.0;
pub const ONE_CYCLE_FINAL_DIV_FACTOR: f32 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LrSchedule {
    /// `lr = base * (s + (1 - s) * min(t, T) / T)`
    Linear {
        base_lr: f32,
        start_factor: f32,
        total_steps: usize,
    },
    /// Cosine warm-up from `max/div` to `max`, then cosine decay to `max/div/final_div`
    OneCycle {
        max_lr: f32,
        total_steps: usize,
        pct_start: f32,
        div_factor: f32,
        final_div_factor: f32,
    },
}

/// Learning-rate scheduler advanced once per optimizer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrScheduler {
    pub schedule: LrSchedule,
    /// Steps taken so far
    pub last_step: usize,
}

fn cos_interp(start: f32, end: f32, pct: f32) -> f32 {
    end + (start - end) / 2.0 * (1.0 + (std::f32::consts::PI * pct).cos())
}

impl LrScheduler {
    pub fn linear(base_lr: f32, total_steps: usize) -> Self {
        Self {
            schedule: LrSchedule::Linear {
                base_lr,
                start_factor: LINEAR_START_FACTOR,
                total_steps,
            },
            last_step: 0,
        }
    }

    pub fn one_cycle(max_lr: f32, total_steps: usize, pct_start: f32) -> Self {
        Self {
            schedule: LrSchedule::OneCycle {
                max_lr,
                total_steps,
                pct_start,
                div_factor: ONE_CYCLE_DIV_FACTOR,
                final_div_factor: ONE_CYCLE_FINAL_DIV_FACTOR,
            },
            last_step: 0,
        }
    }

    /// Learning rate at a given step index.
    #[allow(clippy::cast_precision_loss)]
    pub fn lr_at(&self, step: usize) -> f32 {
        match self.schedule {
            LrSchedule::Linear {
                base_lr,
                start_factor,
                total_steps,
            } => {
                if total_steps == 0 {
                    return base_lr;
                }
                let progress = step.min(total_steps) as f32 / total_steps as f32;
                base_lr * (start_factor + (1.0 - start_factor) * progress)
            }
            LrSchedule::OneCycle {
                max_lr,
                total_steps,
                pct_start,
                div_factor,
                final_div_factor,
            } => {
                let initial = max_lr / div_factor;
                let min_lr = initial / final_div_factor;
                let warm_end = pct_start * total_steps as f32 - 1.0;
                let last = total_steps.saturating_sub(1) as f32;
                let t = step as f32;
                if t <= warm_end {
                    let pct = if warm_end > 0.0 { t / warm_end } else { 1.0 };
                    cos_interp(initial, max_lr, pct)
                } else {
                    let span = last - warm_end.max(0.0);
                    let pct = if span > 0.0 {
                        ((t - warm_end.max(0.0)) / span).min(1.0)
                    } else {
                        1.0
                    };
                    cos_interp(max_lr, min_lr, pct)
                }
            }
        }
    }

    pub fn current_lr(&self) -> f32 {
        self.lr_at(self.last_step)
    }

    /// Advance one step and return the new learning rate.
    pub fn step(&mut self) -> f32 {
        self.last_step += 1;
        self.current_lr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::ModelSpec;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn model() -> BrainModel {
        let spec = ModelSpec {
            num_voxels: vec![3],
            hidden_dim: 4,
            n_blocks: 1,
            clip_dim: 2,
            latent_dim: None,
            perceptual_dim: 2,
            use_prior: false,
        };
        BrainModel::new(&spec, &mut ChaCha8Rng::seed_from_u64(0)).expect("model")
    }

    #[test]
    fn test_first_adam_step_moves_by_lr() {
        let mut model = model();
        let before = model.backbone.clip_proj.bias.clone();
        let mut grads = Gradients::new();
        grads
            .accumulate("backbone.clip_proj.bias", ArrayD::from_elem(IxDyn(&[2]), 2.0))
            .expect("fresh name");

        let mut opt = AdamW::new(0.1);
        opt.step(&mut model, &grads).expect("step");
        assert_eq!(opt.step_count(), 1);
        for (a, b) in model.backbone.clip_proj.bias.iter().zip(before.iter()) {
            // bias: no decay; bias-corrected first step is lr * sign(g)
            assert_abs_diff_eq!(*a, b - 0.1, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_weights_decay_without_gradient_signal() {
        let mut model = model();
        let before = model.ridge.linears[0].weight.clone();
        let mut grads = Gradients::new();
        grads.fill_missing(&model.parameter_shapes());
        let mut opt = AdamW::new(0.5);
        opt.step(&mut model, &grads).expect("step");
        let after = &model.ridge.linears[0].weight;
        for (a, b) in after.iter().zip(before.iter()) {
            assert_abs_diff_eq!(*a, b * (1.0 - 0.5 * DEFAULT_WEIGHT_DECAY), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let mut model = model();
        let mut grads = Gradients::new();
        grads
            .accumulate("ridge.linears.0.bias", ArrayD::zeros(IxDyn(&[5])))
            .expect("fresh name");
        assert!(AdamW::new(0.1).step(&mut model, &grads).is_err());
    }

    #[test]
    fn test_failed_step_updates_nothing() {
        let mut model = model();
        let before = model.clone();
        let mut grads = Gradients::new();
        grads.fill_missing(&model.parameter_shapes());
        // the last visited parameter is malformed; earlier ones must stay put
        let last = model
            .parameter_shapes()
            .last()
            .map(|(name, _)| name.clone())
            .expect("parameters");
        let mut bad = Gradients::new();
        for (name, grad) in grads.iter() {
            let grad = if *name == last {
                ArrayD::zeros(IxDyn(&[grad.len() + 1]))
            } else {
                ArrayD::from_elem(grad.raw_dim(), 1.0)
            };
            bad.accumulate(name, grad).expect("fresh name");
        }

        let mut opt = AdamW::new(0.1);
        assert!(opt.step(&mut model, &bad).is_err());
        assert_eq!(model, before);
        assert_eq!(opt.step_count(), 0);
        assert!(opt.state().moments.is_empty());
    }

    #[test]
    fn test_projection_bias_is_decayed() {
        let mut model = model();
        let before = model.ridge.linears[0].bias.clone();
        let mut grads = Gradients::new();
        grads.fill_missing(&model.parameter_shapes());
        let mut opt = AdamW::new(0.5);
        opt.step(&mut model, &grads).expect("step");
        for (a, b) in model.ridge.linears[0].bias.iter().zip(before.iter()) {
            assert_abs_diff_eq!(*a, b * (1.0 - 0.5 * DEFAULT_WEIGHT_DECAY), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_state_round_trip() {
        let mut model = model();
        let mut grads = Gradients::new();
        grads.fill_missing(&model.parameter_shapes());
        let mut opt = AdamW::new(0.01);
        opt.step(&mut model, &grads).expect("step");
        let json = serde_json::to_string(&opt.state()).expect("serialize");
        let state: OptimizerState = serde_json::from_str(&json).expect("deserialize");
        let mut restored = AdamW::new(1.0);
        restored.load_state(&state).expect("load");
        assert_eq!(restored, opt);
    }

    #[test]
    fn test_no_decay_names() {
        assert!(is_no_decay("backbone.mlp.0.bias"));
        assert!(is_no_decay("backbone.norm.weight"));
        assert!(is_no_decay("diffusion_prior.net.in_proj.bias"));
        assert!(!is_no_decay("ridge.linears.0.weight"));
        assert!(!is_no_decay("ridge.linears.0.bias"));
    }

    #[test]
    fn test_linear_schedule() {
        let s = LrScheduler::linear(3e-4, 10);
        assert_abs_diff_eq!(s.lr_at(0), 1e-4, epsilon = 1e-9);
        assert_abs_diff_eq!(s.lr_at(10), 3e-4, epsilon = 1e-9);
        assert_abs_diff_eq!(s.lr_at(50), 3e-4, epsilon = 1e-9);
    }

    #[test]
    fn test_one_cycle_shape() {
        let mut s = LrScheduler::one_cycle(3e-4, 100, 0.2);
        assert_abs_diff_eq!(s.current_lr(), 3e-4 / 25.0, epsilon = 1e-9);
        let peak = s.lr_at(19);
        assert_abs_diff_eq!(peak, 3e-4, epsilon = 1e-9);
        assert_abs_diff_eq!(s.lr_at(99), 3e-4 / 25.0 / 1000.0, epsilon = 1e-10);
        let next = s.step();
        assert_eq!(s.last_step, 1);
        assert!(next > 3e-4 / 25.0);
    }

    #[test]
    fn test_one_cycle_tiny_warmup_does_not_divide_by_zero() {
        let s = LrScheduler::one_cycle(1e-3, 1, 0.5);
        assert!(s.lr_at(0).is_finite());
    }
}
