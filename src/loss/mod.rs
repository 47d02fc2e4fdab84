//! Contrastive and reconstruction losses, retrieval metrics and schedules.
//!
//! Every differentiable loss returns `(loss, d_input)`, the gradient with
//! respect to the first (student) argument; targets are frozen.
//!
//! ## Soft cross-entropy
//!
//! All contrastive losses reduce to a row-wise soft cross-entropy between
//! logits `S` and soft targets `Q`:
//! ```text
//! L     = -(1/B) Σ_i Σ_j Q_ij log softmax(S_i)_j
//! dL/dS = (1/B) (softmax(S) * rowsum(Q) - Q)
//! ```
//! The `rowsum(Q)` factor matters for the mixup targets read by column,
//! whose rows need not sum to one.

pub mod terms;

pub use terms::{BlurTargets, ClipFormulation, LossInputs, LossTerm, TermOutcome, TermValue};

use crate::core::{NeuroError, NeuroResult};
use crate::data::CorruptionDescriptors;
use ndarray::{Array2, Array4, ArrayView1, Axis, Zip};
use rayon::prelude::*;

fn softmax_rows(x: &Array2<f32>) -> Array2<f32> {
    let mut out = x.clone();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
    out
}

fn log_softmax_rows(x: &Array2<f32>) -> Array2<f32> {
    let mut out = x.clone();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let lse = max + row.mapv(|v| (v - max).exp()).sum().ln();
        row.mapv_inplace(|v| v - lse);
    }
    out
}

/// Row-wise soft cross-entropy, averaged over rows.
///
/// Returns the loss and its gradient with respect to `logits`.
#[allow(clippy::cast_precision_loss)]
pub fn soft_cross_entropy(logits: &Array2<f32>, targets: &Array2<f32>) -> (f32, Array2<f32>) {
    let rows = logits.nrows().max(1) as f32;
    let loss = -(&log_softmax_rows(logits) * targets).sum() / rows;
    let row_mass = targets.sum_axis(Axis(1)).insert_axis(Axis(1));
    let grad = (&softmax_rows(logits) * &row_mass - targets) / rows;
    (loss, grad)
}

/// Symmetric soft-label CLIP loss.
///
/// Soft labels come from target/target similarity:
/// ```text
/// Q = softmax(T T^T / τ)      S = P T^T / τ
/// L = (CE(S, Q) + CE(S^T, Q)) / 2
/// ```
pub fn soft_clip_loss(preds: &Array2<f32>, targets: &Array2<f32>, temp: f32) -> (f32, Array2<f32>) {
    let soft_labels = softmax_rows(&(targets.dot(&targets.t()) / temp));
    let logits = preds.dot(&targets.t()) / temp;
    let (l1, g1) = soft_cross_entropy(&logits, &soft_labels);
    let (l2, g2) = soft_cross_entropy(&logits.t().to_owned(), &soft_labels);
    let d_logits = (g1 + g2.t()) * 0.5;
    let d_preds = d_logits.dot(targets) / temp;
    ((l1 + l2) * 0.5, d_preds)
}

/// Mixup-aware bidirectional noise-contrastive loss.
///
/// Row `i` of the target distribution puts `beta_i` on the diagonal and adds
/// `1 - beta_i` at `perm_i`. The backward direction reads the same matrix
/// by column.
///
/// # Errors
/// - `ShapeMismatch` if the descriptors do not cover the batch
pub fn mixco_nce(
    preds: &Array2<f32>,
    targets: &Array2<f32>,
    temp: f32,
    mixup: &CorruptionDescriptors,
) -> NeuroResult<(f32, Array2<f32>)> {
    let n = preds.nrows();
    if mixup.len() != n || targets.nrows() != n {
        return Err(NeuroError::ShapeMismatch(format!(
            "mixup descriptors for {} rows, batch of {n} predictions and {} targets",
            mixup.len(),
            targets.nrows()
        )));
    }
    let mut probs = Array2::<f32>::zeros((n, n));
    for i in 0..n {
        let beta = mixup.betas[i];
        probs[[i, i]] += beta;
        probs[[i, mixup.perm[i]]] += 1.0 - beta;
    }
    let logits = preds.dot(&targets.t()) / temp;
    let (l1, g1) = soft_cross_entropy(&logits, &probs);
    let (l2, g2) = soft_cross_entropy(&logits.t().to_owned(), &probs.t().to_owned());
    let d_logits = (g1 + g2.t()) * 0.5;
    Ok(((l1 + l2) * 0.5, d_logits.dot(targets) / temp))
}

/// Three-way soft contrastive loss between a student and two target views.
///
/// ```text
/// L1 = CE(S A^T / τ, softmax(T A^T / τ))
/// L2 = CE(A S^T / τ, softmax(A T^T / τ))
/// L  = (L1 + L2) / 2
/// ```
/// `S` student, `T` target, `A` target on augmented input.
pub fn soft_cont_loss(
    student: &Array2<f32>,
    target: &Array2<f32>,
    target_aug: &Array2<f32>,
    temp: f32,
) -> (f32, Array2<f32>) {
    let q1 = softmax_rows(&(target.dot(&target_aug.t()) / temp));
    let q2 = softmax_rows(&(target_aug.dot(&target.t()) / temp));
    let (l1, g1) = soft_cross_entropy(&(student.dot(&target_aug.t()) / temp), &q1);
    let (l2, g2) = soft_cross_entropy(&(target_aug.dot(&student.t()) / temp), &q2);
    let d_student = (g1.dot(target_aug) + g2.t().dot(target_aug)) * (0.5 / temp);
    ((l1 + l2) * 0.5, d_student)
}

/// Mean absolute error and its gradient.
#[allow(clippy::cast_precision_loss)]
pub fn l1_loss(pred: &Array2<f32>, target: &Array2<f32>) -> (f32, Array2<f32>) {
    let n = pred.len().max(1) as f32;
    let diff = pred - target;
    let loss = diff.mapv(f32::abs).sum() / n;
    let grad = diff.mapv(|d| {
        if d > 0.0 {
            1.0 / n
        } else if d < 0.0 {
            -1.0 / n
        } else {
            0.0
        }
    });
    (loss, grad)
}

#[allow(clippy::cast_precision_loss)]
pub fn mse(a: &Array2<f32>, b: &Array2<f32>) -> f32 {
    let diff = a - b;
    diff.mapv(|d| d * d).sum() / diff.len().max(1) as f32
}

fn cosine(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f32 {
    let denom = (a.dot(&a).sqrt() * b.dot(&b).sqrt()).max(1e-8);
    a.dot(&b) / denom
}

/// Mean row-wise cosine similarity.
#[allow(clippy::cast_precision_loss)]
pub fn mean_cosine_similarity(a: &Array2<f32>, b: &Array2<f32>) -> f32 {
    let total: f32 = a
        .rows()
        .into_iter()
        .zip(b.rows())
        .map(|(x, y)| cosine(x, y))
        .sum();
    total / a.nrows().max(1) as f32
}

/// Cosine similarity of every row of `a` with every row of `b`.
pub fn batchwise_cosine_similarity(a: &Array2<f32>, b: &Array2<f32>) -> Array2<f32> {
    let na = a.map_axis(Axis(1), |r| r.dot(&r).sqrt().max(1e-8));
    let nb = b.map_axis(Axis(1), |r| r.dot(&r).sqrt().max(1e-8));
    let outer = na.insert_axis(Axis(1)).dot(&nb.insert_axis(Axis(0)));
    a.dot(&b.t()) / outer
}

/// Fraction of rows whose highest similarity is on the diagonal.
#[allow(clippy::cast_precision_loss)]
pub fn top1_accuracy(similarity: &Array2<f32>) -> f32 {
    let n = similarity.nrows();
    if n == 0 {
        return 0.0;
    }
    let correct = (0..n)
        .into_par_iter()
        .filter(|&i| {
            let row = similarity.row(i);
            let best = row
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(bi, bv), (j, &v)| {
                    if v > bv {
                        (j, v)
                    } else {
                        (bi, bv)
                    }
                })
                .0;
            best == i
        })
        .count();
    correct as f32 / n as f32
}

/// Forward (brain → image) and backward (image → brain) top-1 retrieval.
pub fn retrieval_accuracy(preds: &Array2<f32>, targets: &Array2<f32>) -> (f32, f32) {
    let fwd = top1_accuracy(&batchwise_cosine_similarity(preds, targets));
    let bwd = top1_accuracy(&batchwise_cosine_similarity(targets, preds));
    (fwd, bwd)
}

#[allow(clippy::cast_precision_loss)]
fn pearson(x: ArrayView1<'_, f32>, y: ArrayView1<'_, f32>) -> f32 {
    let n = x.len().max(1) as f32;
    let mx = x.sum() / n;
    let my = y.sum() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    Zip::from(&x).and(&y).for_each(|&a, &b| {
        let (da, db) = (a - mx, b - my);
        sxy += da * db;
        sxx += da * da;
        syy += db * db;
    });
    let denom = (sxx * syy).sqrt();
    if denom <= f32::EPSILON {
        0.0
    } else {
        sxy / denom
    }
}

/// Mean per-image Pearson correlation between flattened image pairs.
///
/// A constant image has zero correlation with anything.
///
/// # Errors
/// - `ShapeMismatch` if the two batches differ in shape
#[allow(clippy::cast_precision_loss)]
pub fn pixcorr(images: &Array4<f32>, recons: &Array4<f32>) -> NeuroResult<f32> {
    if images.dim() != recons.dim() {
        return Err(NeuroError::ShapeMismatch(format!(
            "pixcorr between {:?} and {:?}",
            images.dim(),
            recons.dim()
        )));
    }
    let b = images.len_of(Axis(0));
    if b == 0 {
        return Ok(0.0);
    }
    let flat = |x: &Array4<f32>| -> NeuroResult<Array2<f32>> {
        let per = x.len() / b;
        x.as_standard_layout()
            .to_owned()
            .into_shape((b, per))
            .map_err(|e| NeuroError::ShapeMismatch(e.to_string()))
    };
    let (a, r) = (flat(images)?, flat(recons)?);
    let total: f32 = (0..b)
        .into_par_iter()
        .map(|i| pearson(a.row(i), r.row(i)))
        .sum();
    Ok(total / b as f32)
}

/// Cosine annealing from `start` to `end` over `steps` values.
///
/// `v_i = end + (start - end)/2 * (1 + cos(pi * i / (steps - 1)))`; one step yields `[start]`.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn cosine_anneal(start: f32, end: f32, steps: usize) -> Vec<f32> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..steps)
            .map(|i| {
                let phase = std::f64::consts::PI * i as f64 / (steps - 1) as f64;
                let v = f64::from(end) + f64::from(start - end) / 2.0 * (1.0 + phase.cos());
                v as f32
            })
            .collect(),
    }
}

/// Reject a non-finite loss with its position in training.
pub fn check_loss(value: f32, epoch: usize, iteration: usize) -> NeuroResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(NeuroError::NonFiniteLoss {
            epoch,
            iteration,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::normalize_rows;
    use approx::assert_abs_diff_eq;
    use ndarray::Array;

    fn sample(rows: usize, cols: usize, seed: f32) -> Array2<f32> {
        Array::from_shape_fn((rows, cols), |(i, j)| {
            ((i as f32 + 1.0) * seed + (j as f32) * 0.7).sin()
        })
    }

    fn check_gradient<F>(x: &Array2<f32>, analytic: &Array2<f32>, f: F)
    where
        F: Fn(&Array2<f32>) -> f32,
    {
        let eps = 1e-3;
        for idx in [(0, 0), (1, 2), (x.nrows() - 1, x.ncols() - 1)] {
            let mut plus = x.clone();
            plus[idx] += eps;
            let mut minus = x.clone();
            minus[idx] -= eps;
            let numeric = (f(&plus) - f(&minus)) / (2.0 * eps);
            assert_abs_diff_eq!(analytic[idx], numeric, epsilon = 2e-2);
        }
    }

    #[test]
    fn test_soft_cross_entropy_of_one_hot_is_cross_entropy() {
        let logits = Array2::from_shape_vec((1, 2), vec![0.0, 0.0]).expect("shape");
        let q = Array2::from_shape_vec((1, 2), vec![1.0, 0.0]).expect("shape");
        let (loss, grad) = soft_cross_entropy(&logits, &q);
        assert_abs_diff_eq!(loss, std::f32::consts::LN_2, epsilon = 1e-6);
        assert_abs_diff_eq!(grad[[0, 0]], -0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(grad.sum(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_soft_clip_gradient() {
        let preds = sample(4, 3, 0.9);
        let targets = sample(4, 3, 1.7);
        let (_, grad) = soft_clip_loss(&preds, &targets, 0.5);
        check_gradient(&preds, &grad, |p| soft_clip_loss(p, &targets, 0.5).0);
    }

    #[test]
    fn test_mixco_gradient_with_unnormalized_columns() {
        let preds = sample(4, 3, 0.4);
        let targets = sample(4, 3, 2.3);
        let mixup = CorruptionDescriptors {
            perm: vec![2, 2, 0, 3],
            betas: vec![0.3, 0.8, 1.0, 0.6],
            select: vec![true, true, false, true],
        };
        let (_, grad) = mixco_nce(&preds, &targets, 0.5, &mixup).expect("mixco");
        check_gradient(&preds, &grad, |p| {
            mixco_nce(p, &targets, 0.5, &mixup).expect("mixco").0
        });
    }

    #[test]
    fn test_mixco_identity_descriptors_match_hard_nce() {
        let preds = sample(3, 2, 0.4);
        let targets = sample(3, 2, 1.1);
        let identity = CorruptionDescriptors {
            perm: vec![0, 1, 2],
            betas: vec![0.2, 0.7, 1.0],
            select: vec![true, true, false],
        };
        let (loss, _) = mixco_nce(&preds, &targets, 1.0, &identity).expect("mixco");
        let logits = preds.dot(&targets.t());
        let eye = Array2::eye(3);
        let (fwd, _) = soft_cross_entropy(&logits, &eye);
        let (bwd, _) = soft_cross_entropy(&logits.t().to_owned(), &eye);
        assert_abs_diff_eq!(loss, (fwd + bwd) / 2.0, epsilon = 1e-5);
    }

    #[test]
    fn test_soft_cont_gradient() {
        let student = sample(3, 4, 0.8);
        let target = sample(3, 4, 1.3);
        let aug = sample(3, 4, 1.9);
        let (_, grad) = soft_cont_loss(&student, &target, &aug, 0.5);
        check_gradient(&student, &grad, |s| soft_cont_loss(s, &target, &aug, 0.5).0);
    }

    #[test]
    fn test_l1_loss() {
        let a = Array2::from_shape_vec((1, 2), vec![1.0, -1.0]).expect("shape");
        let b = Array2::zeros((1, 2));
        let (loss, grad) = l1_loss(&a, &b);
        assert_abs_diff_eq!(loss, 1.0);
        assert_abs_diff_eq!(grad[[0, 0]], 0.5);
        assert_abs_diff_eq!(grad[[0, 1]], -0.5);
    }

    #[test]
    fn test_perfect_retrieval() {
        let (x, _) = normalize_rows(&Array2::eye(4));
        let (fwd, bwd) = retrieval_accuracy(&x, &x);
        assert_abs_diff_eq!(fwd, 1.0);
        assert_abs_diff_eq!(bwd, 1.0);
    }

    #[test]
    fn test_retrieval_counts_misses() {
        let preds = Array2::from_shape_vec((2, 2), vec![1.0, 0.0, 1.0, 0.0]).expect("shape");
        let targets = Array2::eye(2);
        let (fwd, _) = retrieval_accuracy(&preds, &targets);
        assert_abs_diff_eq!(fwd, 0.5);
    }

    #[test]
    fn test_pixcorr_identity_and_constant() {
        let images = Array::from_shape_fn((2, 1, 2, 2), |(n, _, y, x)| (n + y * 2 + x) as f32);
        assert_abs_diff_eq!(pixcorr(&images, &images).expect("pixcorr"), 1.0, epsilon = 1e-5);
        let flat = Array4::from_elem((2, 1, 2, 2), 0.5);
        assert_abs_diff_eq!(pixcorr(&images, &flat).expect("pixcorr"), 0.0);
        assert!(pixcorr(&images, &Array4::zeros((1, 1, 2, 2))).is_err());
    }

    #[test]
    fn test_cosine_anneal_endpoints() {
        let temps = cosine_anneal(0.004, 0.0075, 5);
        assert_eq!(temps.len(), 5);
        assert_abs_diff_eq!(temps[0], 0.004, epsilon = 1e-7);
        assert_abs_diff_eq!(temps[4], 0.0075, epsilon = 1e-7);
        assert!(temps.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(cosine_anneal(0.004, 0.0075, 1), vec![0.004]);
    }

    #[test]
    fn test_check_loss() {
        assert!(check_loss(1.0, 0, 0).is_ok());
        let err = check_loss(f32::NAN, 3, 7).expect_err("nan");
        assert!(err.to_string().contains("epoch 3"));
    }
}
