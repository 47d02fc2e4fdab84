//! Loss-term plugins summed by the training step.
//!
//! Each enabled term computes its scalar from the batch targets and the
//! backbone outputs, adds `scale * dTerm` into the output gradients, and
//! reports both its raw value (for metrics) and its weighted contribution
//! to the total loss.

use super::{l1_loss, mean_cosine_similarity, mixco_nce, mse, soft_clip_loss, soft_cont_loss};
use crate::core::model::{BackboneOutput, OutputGrads};
use crate::core::prior::DiffusionPrior;
use crate::core::{normalize_rows, normalize_rows_backward, Gradients, NeuroError, NeuroResult};
use crate::data::CorruptionDescriptors;
use ndarray::Array2;
use rand::Rng;

/// Weight of the perceptual contrastive term inside the reconstruction loss.
pub const BLUR_CONT_WEIGHT: f32 = 0.1;
/// Temperature of the perceptual contrastive term.
pub const BLUR_CONT_TEMP: f32 = 0.2;

/// Contrastive formulation for the current training regime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClipFormulation {
    /// Mixup-aware NCE (Regime A)
    Mixco { temp: f32 },
    /// Symmetric soft-label CLIP loss (Regime B)
    SoftClip { temp: f32 },
}

/// Reconstruction targets computed from the batch images.
#[derive(Debug, Clone)]
pub struct BlurTargets {
    /// Compressed latent of the true images
    pub latent: Array2<f32>,
    /// Perceptual embedding of the true images
    pub perceptual: Array2<f32>,
    /// Perceptual embedding of an augmented view of the true images
    pub perceptual_aug: Array2<f32>,
}

/// Everything a loss term may read besides the backbone outputs.
#[derive(Debug, Clone, Copy)]
pub struct LossInputs<'a> {
    /// Raw (unnormalized) target embedding
    pub clip_target: &'a Array2<f32>,
    pub mixup: Option<&'a CorruptionDescriptors>,
    pub blur: Option<&'a BlurTargets>,
    pub prior: Option<&'a DiffusionPrior>,
}

/// Unweighted values produced by a term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TermValue {
    Prior { loss: f32, cossim: f32, mse: f32 },
    Clip { loss: f32 },
    Blur { l1: f32, cont: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TermOutcome {
    pub value: TermValue,
    /// Contribution to the total loss
    pub weighted: f32,
}

/// An enabled loss term with its weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossTerm {
    Prior { scale: f32 },
    Clip { scale: f32, formulation: ClipFormulation },
    Blur { scale: f32 },
}

impl LossTerm {
    pub fn scale(&self) -> f32 {
        match *self {
            LossTerm::Prior { scale } | LossTerm::Clip { scale, .. } | LossTerm::Blur { scale } => {
                scale
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LossTerm::Prior { .. } => "prior",
            LossTerm::Clip { .. } => "clip",
            LossTerm::Blur { .. } => "blur",
        }
    }

    /// Compute the term and accumulate its weighted gradients.
    ///
    /// Gradients with respect to backbone outputs go into `grads`; the prior
    /// writes its own parameter gradients into `param_grads`.
    ///
    /// # Errors
    /// - `InvalidConfig` if an input the term needs is absent
    /// - `ShapeMismatch` from the underlying losses
    pub fn compute<R: Rng + ?Sized>(
        &self,
        inputs: &LossInputs<'_>,
        outputs: &BackboneOutput,
        grads: &mut OutputGrads,
        param_grads: &mut Gradients,
        rng: &mut R,
    ) -> NeuroResult<TermOutcome> {
        match *self {
            LossTerm::Prior { scale } => {
                let prior = inputs.prior.ok_or_else(|| missing("diffusion prior"))?;
                let (out, cache) =
                    prior.forward_train(&outputs.conditioning, inputs.clip_target, rng)?;
                let d_cond = prior.backward(&cache, scale, param_grads)?;
                grads.conditioning += &d_cond;
                Ok(TermOutcome {
                    value: TermValue::Prior {
                        loss: out.loss,
                        cossim: mean_cosine_similarity(&out.prediction, inputs.clip_target),
                        mse: mse(&out.prediction, inputs.clip_target),
                    },
                    weighted: out.loss * scale,
                })
            }
            LossTerm::Clip { scale, formulation } => {
                let (preds, norms) = normalize_rows(&outputs.clip);
                let (targets, _) = normalize_rows(inputs.clip_target);
                let (loss, d_preds) = match formulation {
                    ClipFormulation::Mixco { temp } => {
                        let mixup = inputs.mixup.ok_or_else(|| missing("mixup descriptors"))?;
                        mixco_nce(&preds, &targets, temp, mixup)?
                    }
                    ClipFormulation::SoftClip { temp } => soft_clip_loss(&preds, &targets, temp),
                };
                grads.clip += &normalize_rows_backward(&preds, &norms, &(d_preds * scale));
                Ok(TermOutcome {
                    value: TermValue::Clip { loss },
                    weighted: loss * scale,
                })
            }
            LossTerm::Blur { scale } => {
                let targets = inputs.blur.ok_or_else(|| missing("reconstruction targets"))?;
                let blur = outputs
                    .blur
                    .as_ref()
                    .ok_or_else(|| missing("reconstruction head"))?;
                let (l1, d_latent) = l1_loss(&blur.latent, &targets.latent);

                let (features, norms) = normalize_rows(&blur.features);
                let (target, _) = normalize_rows(&targets.perceptual);
                let (target_aug, _) = normalize_rows(&targets.perceptual_aug);
                let (cont, d_features) =
                    soft_cont_loss(&features, &target, &target_aug, BLUR_CONT_TEMP);

                let g_latent = grads
                    .blur_latent
                    .as_mut()
                    .ok_or_else(|| missing("reconstruction latent gradient"))?;
                *g_latent += &(d_latent * scale);
                let g_features = grads
                    .blur_features
                    .as_mut()
                    .ok_or_else(|| missing("reconstruction feature gradient"))?;
                *g_features += &normalize_rows_backward(
                    &features,
                    &norms,
                    &(d_features * (BLUR_CONT_WEIGHT * scale)),
                );

                Ok(TermOutcome {
                    value: TermValue::Blur { l1, cont },
                    weighted: (l1 + BLUR_CONT_WEIGHT * cont) * scale,
                })
            }
        }
    }
}

fn missing(what: &str) -> NeuroError {
    NeuroError::InvalidConfig(format!("loss term needs {what}, which is not available"))
}
