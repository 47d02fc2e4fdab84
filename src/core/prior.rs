//! Diffusion prior: maps a conditioning vector to the target embedding distribution.
//!
//! The prior is a conditioned denoiser that predicts the clean target
//! embedding `x0` from a noised embedding `x_t`, the timestep and the
//! conditioning vector:
//!
//! ```text
//! x_t  = sqrt(ᾱ_t) x0 + sqrt(1 - ᾱ_t) ε          ε ~ N(0, I)
//! in   = [x_t, cond | null_cond, time_embed(t)]
//! x̂0   = out_proj(gelu(in_proj(in)))
//! loss = mean((x̂0 - x0)²)
//! ```
//!
//! During training the conditioning of each row is replaced by a learned
//! null embedding with probability [`COND_DROP_PROB`]. All randomness comes
//! from the caller's RNG.

use super::{Activation, GeluActivation, Gradients, Linear, NeuroError, NeuroResult};
use ndarray::{s, Array1, Array2, ArrayViewD, ArrayViewMutD};
use rand::Rng;
use rand_distr::StandardNormal;

/// Number of diffusion timesteps.
pub const TIMESTEPS: usize = 100;
/// Probability of dropping the conditioning for a row in training mode.
pub const COND_DROP_PROB: f64 = 0.2;
/// Width of the sinusoidal timestep embedding.
const TIME_EMBED_DIM: usize = 8;
/// Offset of the cosine noise schedule.
const COSINE_S: f64 = 0.008;

/// Result of one prior pass.
#[derive(Debug, Clone)]
pub struct PriorOutput {
    /// Mean squared error between prediction and target (unscaled)
    pub loss: f32,
    /// Predicted clean embedding
    pub prediction: Array2<f32>,
}

/// Values saved for [`DiffusionPrior::backward`].
#[derive(Debug, Clone)]
pub struct PriorCache {
    input: Array2<f32>,
    pre: Array2<f32>,
    activated: Array2<f32>,
    prediction: Array2<f32>,
    target: Array2<f32>,
    dropped: Vec<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffusionPrior {
    pub dim: usize,
    pub in_proj: Linear,
    pub out_proj: Linear,
    /// Learned conditioning used when a row's conditioning is dropped
    pub null_cond: Array1<f32>,
    alphas_cumprod: Vec<f32>,
}

impl DiffusionPrior {
    pub fn new<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> NeuroResult<Self> {
        let in_dim = 2 * dim + TIME_EMBED_DIM;
        let hidden = 2 * dim;
        Ok(Self {
            dim,
            in_proj: Linear::new(in_dim, hidden, rng)?,
            out_proj: Linear::new(hidden, dim, rng)?,
            null_cond: Array1::zeros(dim),
            alphas_cumprod: cosine_alphas_cumprod(TIMESTEPS),
        })
    }

    /// Training-mode pass: random timesteps, noise and conditioning dropout.
    ///
    /// # Errors
    /// - `ShapeMismatch` if conditioning and target disagree with `dim` or each other
    pub fn forward_train<R: Rng + ?Sized>(
        &self,
        conditioning: &Array2<f32>,
        target: &Array2<f32>,
        rng: &mut R,
    ) -> NeuroResult<(PriorOutput, PriorCache)> {
        self.forward(conditioning, target, rng, true)
    }

    /// Evaluation-mode pass: random timesteps and noise, conditioning never dropped.
    pub fn evaluate<R: Rng + ?Sized>(
        &self,
        conditioning: &Array2<f32>,
        target: &Array2<f32>,
        rng: &mut R,
    ) -> NeuroResult<PriorOutput> {
        Ok(self.forward(conditioning, target, rng, false)?.0)
    }

    fn forward<R: Rng + ?Sized>(
        &self,
        conditioning: &Array2<f32>,
        target: &Array2<f32>,
        rng: &mut R,
        training: bool,
    ) -> NeuroResult<(PriorOutput, PriorCache)> {
        if conditioning.dim() != target.dim() || conditioning.ncols() != self.dim {
            return Err(NeuroError::ShapeMismatch(format!(
                "prior expects ({{B}}, {}) conditioning and target, got {:?} and {:?}",
                self.dim,
                conditioning.dim(),
                target.dim()
            )));
        }
        let batch = target.nrows();
        let dim = self.dim;
        let mut input = Array2::zeros((batch, 2 * dim + TIME_EMBED_DIM));
        let mut dropped = Vec::with_capacity(batch);

        for i in 0..batch {
            let t = rng.gen_range(0..TIMESTEPS);
            let ab = self.alphas_cumprod[t];
            let (signal, noise_scale) = (ab.sqrt(), (1.0 - ab).sqrt());
            {
                let mut noisy = input.slice_mut(s![i, 0..dim]);
                for (dst, &x0) in noisy.iter_mut().zip(target.row(i)) {
                    let eps: f32 = rng.sample(StandardNormal);
                    *dst = signal * x0 + noise_scale * eps;
                }
            }
            let drop = training && rng.gen_bool(COND_DROP_PROB);
            let cond_row = if drop {
                self.null_cond.view()
            } else {
                conditioning.row(i)
            };
            input.slice_mut(s![i, dim..2 * dim]).assign(&cond_row);
            input
                .slice_mut(s![i, 2 * dim..])
                .assign(&time_embedding(t));
            dropped.push(drop);
        }

        let pre = self.in_proj.forward(&input)?;
        let activated = GeluActivation.apply_matrix(&pre);
        let prediction = self.out_proj.forward(&activated)?;
        let diff = &prediction - target;
        #[allow(clippy::cast_precision_loss)]
        let loss = diff.mapv(|d| d * d).sum() / diff.len().max(1) as f32;

        let output = PriorOutput {
            loss,
            prediction: prediction.clone(),
        };
        let cache = PriorCache {
            input,
            pre,
            activated,
            prediction,
            target: target.clone(),
            dropped,
        };
        Ok((output, cache))
    }

    /// Backward pass of `scale * loss`.
    ///
    /// Writes parameter gradients into `param_grads` and returns the gradient
    /// with respect to the conditioning input.
    ///
    /// # Errors
    /// - `ShapeMismatch` if `param_grads` already holds differently shaped prior entries
    pub fn backward(
        &self,
        cache: &PriorCache,
        scale: f32,
        param_grads: &mut Gradients,
    ) -> NeuroResult<Array2<f32>> {
        let dim = self.dim;
        #[allow(clippy::cast_precision_loss)]
        let n = cache.prediction.len().max(1) as f32;
        let d_pred = (&cache.prediction - &cache.target) * (2.0 * scale / n);

        let (g_out, d_act) = self.out_proj.backward(&cache.activated, &d_pred);
        g_out.accumulate_into("diffusion_prior.net.out_proj", param_grads)?;
        let d_pre = d_act * GeluActivation.derivative_matrix(&cache.pre);
        let (g_in, d_input) = self.in_proj.backward(&cache.input, &d_pre);
        g_in.accumulate_into("diffusion_prior.net.in_proj", param_grads)?;

        let mut d_cond = d_input.slice(s![.., dim..2 * dim]).to_owned();
        let mut d_null = Array1::<f32>::zeros(dim);
        for (i, &was_dropped) in cache.dropped.iter().enumerate() {
            if was_dropped {
                d_null += &d_cond.row(i);
                d_cond.row_mut(i).fill(0.0);
            }
        }
        param_grads.accumulate("diffusion_prior.null_cond", d_null.into_dyn())?;
        Ok(d_cond)
    }

    pub(crate) fn named_parameters<'a>(&'a self, out: &mut Vec<(String, ArrayViewD<'a, f32>)>) {
        self.in_proj
            .named_parameters("diffusion_prior.net.in_proj", out);
        self.out_proj
            .named_parameters("diffusion_prior.net.out_proj", out);
        out.push((
            "diffusion_prior.null_cond".to_string(),
            self.null_cond.view().into_dyn(),
        ));
    }

    pub(crate) fn visit_parameters_mut(
        &mut self,
        f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>),
    ) {
        self.in_proj
            .visit_parameters_mut("diffusion_prior.net.in_proj", f);
        self.out_proj
            .visit_parameters_mut("diffusion_prior.net.out_proj", f);
        f("diffusion_prior.null_cond", self.null_cond.view_mut().into_dyn());
    }
}

/// Cumulative signal fractions ᾱ_t of the cosine schedule, t = 0..steps.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn cosine_alphas_cumprod(steps: usize) -> Vec<f32> {
    let f = |t: f64| {
        let x = (t + COSINE_S) / (1.0 + COSINE_S) * std::f64::consts::FRAC_PI_2;
        x.cos().powi(2)
    };
    let f0 = f(0.0);
    (1..=steps)
        .map(|t| (f(t as f64 / steps as f64) / f0).clamp(1e-5, 0.9999) as f32)
        .collect()
}

/// Sinusoidal embedding of a timestep index.
#[allow(clippy::cast_precision_loss)]
fn time_embedding(t: usize) -> Array1<f32> {
    let pos = t as f32 / TIMESTEPS as f32;
    let half = TIME_EMBED_DIM / 2;
    let mut emb = Array1::zeros(TIME_EMBED_DIM);
    for k in 0..half {
        let freq = (1u32 << k) as f32 * std::f32::consts::PI;
        emb[k] = (pos * freq).sin();
        emb[half + k] = (pos * freq).cos();
    }
    emb
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_schedule_is_decreasing() {
        let ab = cosine_alphas_cumprod(TIMESTEPS);
        assert_eq!(ab.len(), TIMESTEPS);
        assert!(ab.windows(2).all(|w| w[0] >= w[1]));
        assert!(ab[0] > 0.99);
        assert!(ab[TIMESTEPS - 1] < 0.01);
    }

    #[test]
    fn test_loss_is_finite_and_shape_checked() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let prior = DiffusionPrior::new(4, &mut rng).unwrap();
        let cond = Array2::from_elem((3, 4), 0.5);
        let target = Array2::from_elem((3, 4), -0.25);
        let (out, _) = prior.forward_train(&cond, &target, &mut rng).unwrap();
        assert!(out.loss.is_finite());
        assert_eq!(out.prediction.dim(), (3, 4));

        let bad = Array2::zeros((3, 5));
        assert!(prior.evaluate(&bad, &target, &mut rng).is_err());
    }

    #[test]
    fn test_backward_matches_finite_difference_on_conditioning() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let prior = DiffusionPrior::new(3, &mut rng).unwrap();
        let cond = Array2::from_shape_fn((2, 3), |(i, j)| 0.3 * (i as f32) - 0.2 * (j as f32));
        let target = Array2::from_shape_fn((2, 3), |(i, j)| 0.1 * ((i + j) as f32));

        // Same seed → same timesteps, noise and dropout for both passes.
        let run = |c: &Array2<f32>| {
            let mut r = ChaCha8Rng::seed_from_u64(77);
            prior.evaluate(c, &target, &mut r).unwrap().loss
        };
        let mut r = ChaCha8Rng::seed_from_u64(77);
        let (_, cache) = prior.forward(&cond, &target, &mut r, false).unwrap();
        let mut grads = Gradients::new();
        let d_cond = prior.backward(&cache, 1.0, &mut grads).unwrap();

        let eps = 1e-2;
        let mut bumped = cond.clone();
        bumped[[1, 2]] += eps;
        let numeric = (run(&bumped) - run(&cond)) / eps;
        assert_abs_diff_eq!(d_cond[[1, 2]], numeric, epsilon = 2e-2);
        assert!(grads.get("diffusion_prior.net.in_proj.weight").is_some());
        assert!(grads.get("diffusion_prior.null_cond").is_some());
    }

    #[test]
    fn test_time_embedding_width() {
        let emb = time_embedding(10);
        assert_eq!(emb.len(), TIME_EMBED_DIM);
        assert!(emb.iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn test_dropped_rows_route_gradient_to_null_embedding() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let prior = DiffusionPrior::new(2, &mut rng).unwrap();
        let cond = Array2::from_elem((64, 2), 1.0);
        let target = Array2::from_elem((64, 2), 0.0);
        let (_, cache) = prior.forward_train(&cond, &target, &mut rng).unwrap();
        let dropped = cache.dropped.iter().filter(|d| **d).count();
        assert!(dropped > 0 && dropped < 64);

        let mut grads = Gradients::new();
        let d_cond = prior.backward(&cache, 1.0, &mut grads).unwrap();
        for (i, &was_dropped) in cache.dropped.iter().enumerate() {
            if was_dropped {
                assert!(d_cond.row(i).iter().all(|v| *v == 0.0));
            }
        }
    }
}
