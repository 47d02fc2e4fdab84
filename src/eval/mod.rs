//! Evaluation Pass: repeat-averaged scoring of the held-out split.
//!
//! Test trials are grouped by image. Every group is padded or truncated to
//! exactly three presentations, each presentation runs the full forward path,
//! and the three contrastive embeddings and conditioning vectors are averaged
//! before any loss is computed. The whole split is scored as one batch.
//!
//! ## Repeat padding
//! ```text
//! presentations  [a]        → [a, a, a]
//!                [a, b]     → [a, b, a]
//!                [a, b, c…] → [a, b, c]
//! ```

use crate::core::model::{BackboneOutput, BlurOutput, BrainModel};
use crate::core::{normalize_rows, NeuroError, NeuroResult};
use crate::data::{fetch_images, ImageStore, Subject, Trial};
use crate::encoders::Encoders;
use crate::loss::{
    check_loss, mean_cosine_similarity, mse, pixcorr, retrieval_accuracy, soft_clip_loss,
};
use crate::TrainConfig;
use ndarray::{Array2, Axis};
use rand::seq::index;
use rand::Rng;
use std::collections::BTreeMap;
use tracing::debug;

/// Number of presentations averaged per test image.
pub const REPEATS: usize = 3;
/// Soft-CLIP temperature used for test loss.
pub const TEST_CLIP_TEMP: f32 = 0.006;

/// One test image and the voxel rows of its three (possibly reused) presentations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatGroup {
    pub image_index: usize,
    pub voxel_rows: [usize; REPEATS],
}

impl RepeatGroup {
    /// Build a group from the voxel rows of an image's presentations, in stream order.
    ///
    /// Returns `None` when there are no presentations.
    pub fn from_locations(image_index: usize, locations: &[usize]) -> Option<Self> {
        let voxel_rows = match *locations {
            [] => return None,
            [a] => [a, a, a],
            [a, b] => [a, b, a],
            [a, b, c, ..] => [a, b, c],
        };
        Some(Self {
            image_index,
            voxel_rows,
        })
    }
}

/// Group trials by image, in increasing image order.
pub fn group_repeats(trials: &[Trial]) -> Vec<RepeatGroup> {
    let mut locations: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for trial in trials {
        locations
            .entry(trial.image_index)
            .or_default()
            .push(trial.voxel_index);
    }
    locations
        .into_iter()
        .filter_map(|(image, rows)| RepeatGroup::from_locations(image, &rows))
        .collect()
}

fn mean_of(arrays: &[&Array2<f32>]) -> NeuroResult<Array2<f32>> {
    let (first, rest) = arrays
        .split_first()
        .ok_or_else(|| NeuroError::ShapeMismatch("nothing to average".to_string()))?;
    let mut sum = (*first).clone();
    for a in rest {
        if a.dim() != sum.dim() {
            return Err(NeuroError::ShapeMismatch(format!(
                "averaging {:?} with {:?}",
                sum.dim(),
                a.dim()
            )));
        }
        sum += *a;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = arrays.len() as f32;
    Ok(sum / n)
}

/// Average backbone outputs over repeats.
///
/// Contrastive embedding, conditioning and (when present) the reconstruction
/// outputs are each summed then divided by the number of repeats.
///
/// # Errors
/// - `ShapeMismatch` if `outputs` is empty or shapes disagree
pub fn average_repeats(outputs: &[BackboneOutput]) -> NeuroResult<BackboneOutput> {
    let clip: Vec<_> = outputs.iter().map(|o| &o.clip).collect();
    let conditioning: Vec<_> = outputs.iter().map(|o| &o.conditioning).collect();
    let blur = match outputs
        .iter()
        .map(|o| o.blur.as_ref())
        .collect::<Option<Vec<_>>>()
    {
        Some(parts) if !parts.is_empty() => {
            let latent: Vec<_> = parts.iter().map(|b| &b.latent).collect();
            let features: Vec<_> = parts.iter().map(|b| &b.features).collect();
            Some(BlurOutput {
                latent: mean_of(&latent)?,
                features: mean_of(&features)?,
            })
        }
        _ => None,
    };
    Ok(BackboneOutput {
        clip: mean_of(&clip)?,
        conditioning: mean_of(&conditioning)?,
        blur,
    })
}

/// Test-split metrics of one evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TestMetrics {
    /// Sum of enabled, scaled test losses
    pub loss: f32,
    /// Unscaled soft-CLIP loss
    pub loss_clip: f32,
    /// Unscaled prior loss
    pub loss_prior: f32,
    pub fwd_pct_correct: f32,
    pub bwd_pct_correct: f32,
    pub blurry_pixcorr: f32,
    pub recon_cossim: f32,
    pub recon_mse: f32,
    /// Number of repeat groups scored
    pub num_groups: usize,
}

/// Random subset of `max(1, n / 5)` row indices, sorted.
pub(crate) fn eval_subset<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<usize> {
    let size = (n / 5).max(1).min(n);
    let mut picked = index::sample(rng, n, size).into_vec();
    picked.sort_unstable();
    picked
}

/// Score a subject's held-out split through projection slot `slot`.
///
/// # Errors
/// - `InvalidConfig` if the subject has no test trials
/// - `NonFiniteLoss` if the test loss is not finite
/// - errors from encoders and the forward pass
#[allow(clippy::too_many_arguments)]
pub fn evaluate<R: Rng + ?Sized>(
    model: &BrainModel,
    subject: &Subject,
    slot: usize,
    images: &dyn ImageStore,
    encoders: &Encoders,
    config: &TrainConfig,
    epoch: usize,
    rng: &mut R,
) -> NeuroResult<TestMetrics> {
    let groups = group_repeats(&subject.test);
    if groups.is_empty() {
        return Err(NeuroError::InvalidConfig(format!(
            "subject {} has no test trials",
            subject.id
        )));
    }
    let image_ids: Vec<usize> = groups.iter().map(|g| g.image_index).collect();
    let test_images = fetch_images(images, &image_ids)?;
    let clip_target = encoders.clip.embed(&test_images)?;

    let outputs = (0..REPEATS)
        .map(|rep| {
            let rows: Vec<usize> = groups.iter().map(|g| g.voxel_rows[rep]).collect();
            model.forward_subject(&subject.voxels.rows(&rows)?, slot)
        })
        .collect::<NeuroResult<Vec<_>>>()?;
    let averaged = average_repeats(&outputs)?;

    let subset = eval_subset(groups.len(), rng);
    let mut metrics = TestMetrics {
        num_groups: groups.len(),
        ..TestMetrics::default()
    };

    if let Some(prior) = model.diffusion_prior.as_ref().filter(|_| config.use_prior) {
        let cond = averaged.conditioning.select(Axis(0), &subset);
        let target = clip_target.select(Axis(0), &subset);
        let out = prior.evaluate(&cond, &target, rng)?;
        metrics.loss_prior = out.loss;
        metrics.recon_cossim = mean_cosine_similarity(&out.prediction, &target);
        metrics.recon_mse = mse(&out.prediction, &target);
        metrics.loss += out.loss * config.prior_scale;
    }

    let (preds, _) = normalize_rows(&averaged.clip);
    let (targets, _) = normalize_rows(&clip_target);
    if config.clip_scale > 0.0 {
        let (loss_clip, _) = soft_clip_loss(&preds, &targets, TEST_CLIP_TEMP);
        metrics.loss_clip = loss_clip;
        metrics.loss += loss_clip * config.clip_scale;
    }
    let (fwd, bwd) = retrieval_accuracy(&preds, &targets);
    metrics.fwd_pct_correct = fwd;
    metrics.bwd_pct_correct = bwd;

    if let Some(blur) = &averaged.blur {
        let recon = encoders.latent.decode(&blur.latent.select(Axis(0), &subset))?;
        metrics.blurry_pixcorr = pixcorr(&test_images.select(Axis(0), &subset), &recon)?;
    }

    check_loss(metrics.loss, epoch, 0)?;
    debug!(
        subject = subject.id,
        groups = groups.len(),
        loss = metrics.loss,
        "evaluation pass"
    );
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array;
    use rand::SeedableRng;

    fn trial(image_index: usize, voxel_index: usize) -> Trial {
        Trial {
            image_index,
            voxel_index,
            session: 0,
            repeat: 0,
        }
    }

    #[test]
    fn test_repeat_padding_rule() {
        assert_eq!(RepeatGroup::from_locations(0, &[]), None);
        let one = RepeatGroup::from_locations(4, &[7]).expect("group");
        assert_eq!(one.voxel_rows, [7, 7, 7]);
        let two = RepeatGroup::from_locations(4, &[7, 9]).expect("group");
        assert_eq!(two.voxel_rows, [7, 9, 7]);
        let four = RepeatGroup::from_locations(4, &[1, 2, 3, 4]).expect("group");
        assert_eq!(four.voxel_rows, [1, 2, 3]);
    }

    #[test]
    fn test_group_repeats_sorts_by_image() {
        let trials = [trial(5, 0), trial(2, 1), trial(5, 2), trial(2, 3), trial(2, 4)];
        let groups = group_repeats(&trials);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].image_index, 2);
        assert_eq!(groups[0].voxel_rows, [1, 3, 4]);
        assert_eq!(groups[1].voxel_rows, [0, 2, 0]);
    }

    #[test]
    fn test_average_repeats_is_exact_mean() {
        let make = |s: f32| BackboneOutput {
            conditioning: Array::from_shape_fn((2, 3), |(i, j)| s * (i + j) as f32),
            clip: Array::from_shape_fn((2, 3), |(i, j)| s - (i * j) as f32),
            blur: None,
        };
        let (a, b, c) = (make(1.0), make(0.3), make(-2.5));
        let avg = average_repeats(&[a.clone(), b.clone(), c.clone()]).expect("average");
        let expected = (&a.clip + &b.clip + &c.clip) / 3.0;
        assert_eq!(avg.clip, expected);
        let expected_cond = (&a.conditioning + &b.conditioning + &c.conditioning) / 3.0;
        for (x, y) in avg.conditioning.iter().zip(expected_cond.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-6);
        }
        assert!(avg.blur.is_none());
    }

    #[test]
    fn test_average_rejects_empty() {
        assert!(average_repeats(&[]).is_err());
    }

    #[test]
    fn test_eval_subset_size() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);
        assert_eq!(eval_subset(3, &mut rng).len(), 1);
        let picked = eval_subset(23, &mut rng);
        assert_eq!(picked.len(), 4);
        assert!(picked.windows(2).all(|w| w[0] < w[1]));
    }
}
