//! Epoch batch preloading and mixup corruption.
//!
//! Before an epoch starts, every subject's trial stream is drained into a
//! fixed number of batches. Batches with a repeated image index are dropped
//! and counted. Subject sub-batches are then concatenated in subject order,
//! so subject `k` always occupies the same row range of the combined batch.
//!
//! ## Mixup
//!
//! ```text
//! perm   = random permutation of 0..b
//! beta_i ~ Beta(0.15, 0.15)        select_i ~ Bernoulli(0.5)
//! v'_i   = beta_i v_i + (1 - beta_i) v_perm(i)     if select_i
//! v'_i   = v_i,  beta_i = 1                          otherwise
//! ```
//!
//! Descriptors are sampled per subject sub-batch and shifted by the
//! sub-batch's row offset when concatenated.

use super::{fetch_images, has_unique_images, ImageStore, Subject, TrialStream};
use crate::core::model::SubjectSlice;
use crate::core::{NeuroError, NeuroResult};
use ndarray::{Array2, Array4, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Beta, Distribution};
use tracing::{debug, warn};

/// Shape parameter of the symmetric Beta distribution for mixup coefficients.
pub const MIXUP_BETA: f32 = 0.15;
/// Probability that a sample is interpolated.
pub const MIXUP_SELECT_PROB: f64 = 0.5;
/// Minimum fetch attempts per subject per epoch.
const MIN_FETCH_BUDGET: usize = 64;

/// Per-batch mixup state: permutation, interpolation coefficients and selection mask.
#[derive(Debug, Clone, PartialEq)]
pub struct CorruptionDescriptors {
    pub perm: Vec<usize>,
    pub betas: Vec<f32>,
    pub select: Vec<bool>,
}

impl CorruptionDescriptors {
    /// Sample descriptors for a batch of `n` rows.
    pub fn sample<R: Rng + ?Sized>(n: usize, rng: &mut R) -> NeuroResult<Self> {
        let beta = Beta::new(MIXUP_BETA, MIXUP_BETA)
            .map_err(|e| NeuroError::InvalidConfig(format!("mixup beta: {e}")))?;
        let mut perm: Vec<usize> = (0..n).collect();
        perm.shuffle(rng);
        let mut betas = Vec::with_capacity(n);
        let mut select = Vec::with_capacity(n);
        for _ in 0..n {
            let b = beta.sample(rng);
            let chosen = rng.gen_bool(MIXUP_SELECT_PROB);
            betas.push(if chosen { b } else { 1.0 });
            select.push(chosen);
        }
        Ok(Self {
            perm,
            betas,
            select,
        })
    }

    pub fn len(&self) -> usize {
        self.perm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.perm.is_empty()
    }

    /// Interpolate selected rows with their permuted partners.
    ///
    /// Partners are read from the uncorrupted input.
    ///
    /// # Errors
    /// - `ShapeMismatch` if the batch size differs from the descriptor length
    pub fn apply(&self, voxels: &Array2<f32>) -> NeuroResult<Array2<f32>> {
        if voxels.nrows() != self.len() {
            return Err(NeuroError::ShapeMismatch(format!(
                "mixup descriptors for {} rows applied to {}",
                self.len(),
                voxels.nrows()
            )));
        }
        let mut out = voxels.clone();
        for (i, &chosen) in self.select.iter().enumerate() {
            if !chosen {
                continue;
            }
            let b = self.betas[i];
            let mixed = &voxels.row(i) * b + &voxels.row(self.perm[i]) * (1.0 - b);
            out.row_mut(i).assign(&mixed);
        }
        Ok(out)
    }

    /// Concatenate sub-batch descriptors, shifting each permutation by its row offset.
    pub fn concat(parts: &[CorruptionDescriptors]) -> Self {
        let mut combined = Self {
            perm: Vec::new(),
            betas: Vec::new(),
            select: Vec::new(),
        };
        for part in parts {
            let offset = combined.len();
            combined.perm.extend(part.perm.iter().map(|p| p + offset));
            combined.betas.extend_from_slice(&part.betas);
            combined.select.extend_from_slice(&part.select);
        }
        combined
    }
}

/// One subject's rows of a combined batch.
#[derive(Debug, Clone)]
pub struct SubjectPart {
    /// Position of the subject in the subject list
    pub slot: usize,
    pub subject: u8,
    pub image_indices: Vec<usize>,
    /// Voxel vectors, already mixed when the batch carries mixup descriptors
    pub voxels: Array2<f32>,
}

/// A combined training batch across subjects.
#[derive(Debug, Clone)]
pub struct TrainingBatch {
    pub parts: Vec<SubjectPart>,
    /// Images for all rows, in the same order as the concatenated parts
    pub images: Array4<f32>,
    /// Combined mixup descriptors (Regime A only)
    pub mixup: Option<CorruptionDescriptors>,
}

impl TrainingBatch {
    pub fn len(&self) -> usize {
        self.parts.iter().map(|p| p.voxels.nrows()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slices(&self) -> Vec<SubjectSlice<'_>> {
        self.parts
            .iter()
            .map(|p| SubjectSlice {
                slot: p.slot,
                voxels: &p.voxels,
            })
            .collect()
    }

    pub fn image_indices(&self) -> Vec<usize> {
        self.parts
            .iter()
            .flat_map(|p| p.image_indices.iter().copied())
            .collect()
    }
}

/// All batches of one epoch, preloaded.
#[derive(Debug, Clone)]
pub struct EpochBatches {
    pub batches: Vec<TrainingBatch>,
    /// Batches dropped for repeated image indices, summed over subjects
    pub dropped: usize,
    /// Requested iterations per epoch
    pub quota: usize,
}

struct Fetched {
    image_indices: Vec<usize>,
    voxels: Array2<f32>,
    images: Array4<f32>,
}

/// Drains per-subject trial streams into preloaded epochs.
#[derive(Debug, Clone)]
pub struct BatchAssembler {
    streams: Vec<TrialStream>,
}

impl BatchAssembler {
    /// One resampling stream per subject, seeded from `seed` and the subject id.
    pub fn new(subjects: &[Subject], per_subject_batch: usize, seed: u64) -> Self {
        let streams = subjects
            .iter()
            .map(|s| {
                TrialStream::new(
                    s.train.clone(),
                    per_subject_batch,
                    true,
                    seed.wrapping_mul(1000).wrapping_add(u64::from(s.id)),
                )
            })
            .collect();
        Self { streams }
    }

    /// Use caller-built streams, one per subject in subject order.
    pub fn from_streams(streams: Vec<TrialStream>) -> Self {
        Self { streams }
    }

    /// Preload up to `quota` combined batches.
    ///
    /// Each subject's stream is read until it has filled `quota` batches, the
    /// stream ends, or the fetch budget `max(64, 16 * quota)` is spent. The
    /// epoch holds as many batches as the least-filled subject.
    ///
    /// # Errors
    /// - `InvalidConfig` if the subject count differs from the stream count
    /// - `ShapeMismatch` from voxel or image lookups
    pub fn assemble_epoch<R: Rng + ?Sized>(
        &mut self,
        subjects: &[Subject],
        images: &dyn ImageStore,
        quota: usize,
        mixup: bool,
        rng: &mut R,
    ) -> NeuroResult<EpochBatches> {
        if subjects.len() != self.streams.len() {
            return Err(NeuroError::InvalidConfig(format!(
                "{} subjects for {} trial streams",
                subjects.len(),
                self.streams.len()
            )));
        }
        let budget = MIN_FETCH_BUDGET.max(16 * quota);
        let mut dropped = 0;
        let mut per_subject = Vec::with_capacity(subjects.len());

        for (subject, stream) in subjects.iter().zip(&mut self.streams) {
            let mut filled = Vec::with_capacity(quota);
            let mut subject_dropped = 0;
            for _ in 0..budget {
                if filled.len() == quota {
                    break;
                }
                let Some(trials) = stream.next_batch() else {
                    break;
                };
                if !has_unique_images(&trials) {
                    subject_dropped += 1;
                    continue;
                }
                let image_indices: Vec<usize> = trials.iter().map(|t| t.image_index).collect();
                let voxel_rows: Vec<usize> = trials.iter().map(|t| t.voxel_index).collect();
                filled.push(Fetched {
                    voxels: subject.voxels.rows(&voxel_rows)?,
                    images: fetch_images(images, &image_indices)?,
                    image_indices,
                });
            }
            if subject_dropped > 0 {
                debug!(
                    subject = subject.id,
                    dropped = subject_dropped,
                    "dropped batches with repeated images"
                );
            }
            dropped += subject_dropped;
            per_subject.push(filled);
        }

        let iterations = per_subject.iter().map(Vec::len).min().unwrap_or(0);
        if iterations < quota {
            warn!(
                iterations,
                quota, "epoch preload fell short of the iteration quota"
            );
        }

        let mut streams: Vec<_> = per_subject.into_iter().map(Vec::into_iter).collect();
        let mut batches = Vec::with_capacity(iterations);
        for _ in 0..iterations {
            let mut parts = Vec::with_capacity(subjects.len());
            let mut image_parts = Vec::with_capacity(subjects.len());
            let mut descriptors = Vec::new();
            for (slot, (subject, fetched)) in subjects.iter().zip(&mut streams).enumerate() {
                let Some(f) = fetched.next() else {
                    continue;
                };
                let voxels = if mixup {
                    let d = CorruptionDescriptors::sample(f.voxels.nrows(), rng)?;
                    let mixed = d.apply(&f.voxels)?;
                    descriptors.push(d);
                    mixed
                } else {
                    f.voxels
                };
                image_parts.push(f.images);
                parts.push(SubjectPart {
                    slot,
                    subject: subject.id,
                    image_indices: f.image_indices,
                    voxels,
                });
            }
            let views: Vec<_> = image_parts.iter().map(Array4::view).collect();
            let images = ndarray::concatenate(Axis(0), &views)
                .map_err(|e| NeuroError::ShapeMismatch(e.to_string()))?;
            batches.push(TrainingBatch {
                parts,
                images,
                mixup: mixup.then(|| CorruptionDescriptors::concat(&descriptors)),
            });
        }

        Ok(EpochBatches {
            batches,
            dropped,
            quota,
        })
    }
}
