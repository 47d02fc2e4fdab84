//! # neuroclip
//!
//! Training orchestration for mapping fMRI voxel patterns into the embedding
//! space of a frozen vision-language image encoder.
//!
//! ## Overview
//!
//! Every subject's voxel vectors pass through a subject-specific linear
//! projection into a shared latent space. A shared backbone maps that latent
//! to a contrastive embedding, a conditioning vector for a diffusion prior,
//! and optionally a coarse image latent. Training mixes a contrastive loss
//! (mixup-aware early, soft-label later), the prior's denoising loss and a
//! reconstruction loss.
//!
//! ## Structure
//!
//! - [`core`]: error type, linear layers, gradients, model and diffusion prior
//! - [`data`]: voxel stores, trial streams, epoch batch preloading, mixup
//! - [`encoders`]: frozen image embedders, latent codec and augmenters
//! - [`loss`]: contrastive formulations, reconstruction terms, metrics
//! - [`optim`]: AdamW and learning-rate schedules
//! - [`training`]: training state, loss orchestration and the epoch loop
//! - [`eval`]: repeat-averaged test evaluation
//! - [`checkpoint`]: rank-gated save and flag-controlled restore
//! - [`distributed`]: data-parallel collectives
//! - [`metrics`]: per-epoch report and sinks

pub mod checkpoint;
pub mod core;
pub mod data;
pub mod distributed;
pub mod encoders;
pub mod eval;
pub mod loss;
pub mod metrics;
pub mod optim;
pub mod training;

pub use crate::core::model::{BackboneOutput, BrainModel, ModelSpec};
pub use crate::core::{NeuroError, NeuroResult};
pub use checkpoint::{CheckpointManager, LoadOptions};
pub use distributed::{Collective, SingleProcess, ThreadGroup};
pub use metrics::{EpochReport, JsonlSink, MetricsSink};
pub use training::{LossAggregate, Trainer, TrainingState};

use crate::data::{SubjectRequest, TestSplit};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Number of subjects in the data set.
pub const NUM_SUBJECTS: u8 = 8;
/// Trials recorded per scanning session.
pub const TRIALS_PER_SESSION: usize = 750;
/// Sessions available per subject, used in multi-subject mode.
pub const SESSIONS_PER_SUBJECT: [usize; 8] = [40, 40, 32, 30, 40, 32, 40, 30];
/// Sessions assumed when computing the multi-subject epoch size.
pub const MULTI_SUBJECT_SESSIONS: usize = 40;

const OLD_TEST_TRIALS: [usize; 8] = [2770, 2770, 2113, 1985, 2770, 2113, 2770, 1985];
const NEW_TEST_TRIALS: [usize; 8] = [3000, 3000, 2371, 2188, 3000, 2371, 3000, 2188];

/// Learning-rate schedule selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrSchedulerKind {
    /// One-cycle cosine schedule
    Cycle,
    /// Linear warm factor from 1/3 to 1
    Linear,
}

/// Training configuration.
///
/// Built once, validated, then shared by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Run name; checkpoints go to `<output_dir>/<model_name>/`
    pub model_name: String,
    pub data_path: PathBuf,
    pub output_dir: PathBuf,
    /// Subject to train on, or the held-out subject in multi-subject mode
    pub subject: u8,
    /// Sessions of training data in single-subject mode
    pub num_sessions: usize,
    pub multi_subject: bool,
    /// Multi-subject run directory to fine-tune from
    pub multisubject_ckpt: Option<PathBuf>,
    pub use_prior: bool,
    /// Per-worker batch, split evenly across subjects
    pub batch_size: usize,
    /// Fraction of epochs trained with mixup
    pub mixup_pct: f32,
    pub blurry_recon: bool,
    pub blur_scale: f32,
    pub clip_scale: f32,
    pub prior_scale: f32,
    pub use_image_aug: bool,
    pub num_epochs: usize,
    /// Evaluate on the new rather than the old held-out split
    pub new_test: bool,
    pub n_blocks: usize,
    pub hidden_dim: usize,
    pub lr_scheduler_type: LrSchedulerKind,
    pub max_lr: f32,
    pub ckpt_saving: bool,
    /// Epochs between checkpoints
    pub ckpt_interval: usize,
    /// Restore the `last` checkpoint of this run at startup
    pub resume: bool,
    pub seed: u64,
    /// Data-parallel workers
    pub world_size: usize,
    /// Overrides `750 * sessions / world_size`
    pub samples_per_epoch: Option<usize>,
    pub clip_dim: usize,
    pub perceptual_dim: usize,
    pub latent_pool: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model_name: "pre_train_subj01".to_string(),
            data_path: PathBuf::from("."),
            output_dir: PathBuf::from("train_logs"),
            subject: 1,
            num_sessions: 40,
            multi_subject: false,
            multisubject_ckpt: None,
            use_prior: true,
            batch_size: 20,
            mixup_pct: 0.33,
            blurry_recon: true,
            blur_scale: 0.5,
            clip_scale: 1.0,
            prior_scale: 30.0,
            use_image_aug: false,
            num_epochs: 150,
            new_test: true,
            n_blocks: 2,
            hidden_dim: 256,
            lr_scheduler_type: LrSchedulerKind::Cycle,
            max_lr: 3e-4,
            ckpt_saving: true,
            ckpt_interval: 1,
            resume: false,
            seed: 42,
            world_size: 1,
            samples_per_epoch: None,
            clip_dim: 64,
            perceptual_dim: 32,
            latent_pool: 4,
        }
    }
}

impl TrainConfig {
    /// Check every option before any data is touched.
    ///
    /// # Errors
    /// - `InvalidConfig` naming the first offending option
    pub fn validate(&self) -> NeuroResult<()> {
        let fail = |msg: String| Err(NeuroError::InvalidConfig(msg));
        if !(1..=NUM_SUBJECTS).contains(&self.subject) {
            return fail(format!("subject must be in 1..=8, got {}", self.subject));
        }
        if !self.multi_subject && self.num_sessions == 0 {
            return fail("num_sessions must be positive".to_string());
        }
        let subjects = self.subject_list().len();
        if self.batch_size < subjects || self.batch_size % subjects != 0 {
            return fail(format!(
                "batch_size {} must be a positive multiple of the {subjects} training subjects",
                self.batch_size
            ));
        }
        if !(0.0..=1.0).contains(&self.mixup_pct) {
            return fail(format!("mixup_pct must be in [0, 1], got {}", self.mixup_pct));
        }
        if self.num_epochs == 0 {
            return fail("num_epochs must be at least 1".to_string());
        }
        if self.ckpt_interval == 0 {
            return fail("ckpt_interval must be at least 1".to_string());
        }
        for (name, scale) in [
            ("blur_scale", self.blur_scale),
            ("clip_scale", self.clip_scale),
            ("prior_scale", self.prior_scale),
        ] {
            if !scale.is_finite() || scale < 0.0 {
                return fail(format!("{name} must be finite and non-negative, got {scale}"));
            }
        }
        if !(self.max_lr.is_finite() && self.max_lr > 0.0) {
            return fail(format!("max_lr must be positive, got {}", self.max_lr));
        }
        if self.multisubject_ckpt.is_some() && self.multi_subject {
            return fail("multisubject_ckpt is only valid for single-subject runs".to_string());
        }
        if self.world_size == 0 {
            return fail("world_size must be at least 1".to_string());
        }
        if self.hidden_dim == 0 || self.clip_dim == 0 || self.perceptual_dim == 0 {
            return fail("model widths must be positive".to_string());
        }
        if self.latent_pool == 0 {
            return fail("latent_pool must be positive".to_string());
        }
        if self.iterations_per_epoch() == 0 {
            return fail(format!(
                "{} samples per epoch cannot fill one batch of {}",
                self.samples_per_epoch(),
                self.batch_size
            ));
        }
        Ok(())
    }

    /// Subjects trained on, in slot order.
    pub fn subject_list(&self) -> Vec<u8> {
        if self.multi_subject {
            (1..=NUM_SUBJECTS).filter(|s| *s != self.subject).collect()
        } else {
            vec![self.subject]
        }
    }

    /// Subject whose test split is scored: the first trained subject.
    pub fn eval_subject(&self) -> u8 {
        self.subject_list().first().copied().unwrap_or(self.subject)
    }

    pub fn subject_requests(&self) -> Vec<SubjectRequest> {
        self.subject_list()
            .into_iter()
            .map(|id| SubjectRequest {
                id,
                num_sessions: if self.multi_subject {
                    SESSIONS_PER_SUBJECT[usize::from(id) - 1]
                } else {
                    self.num_sessions
                },
            })
            .collect()
    }

    pub fn test_split(&self) -> TestSplit {
        if self.new_test {
            TestSplit::New
        } else {
            TestSplit::Old
        }
    }

    pub fn per_subject_batch_size(&self) -> usize {
        self.batch_size / self.subject_list().len()
    }

    /// Samples each worker trains on per epoch.
    pub fn samples_per_epoch(&self) -> usize {
        self.samples_per_epoch.unwrap_or_else(|| {
            let sessions = if self.multi_subject {
                MULTI_SUBJECT_SESSIONS
            } else {
                self.num_sessions
            };
            TRIALS_PER_SESSION * sessions / self.world_size.max(1)
        })
    }

    pub fn iterations_per_epoch(&self) -> usize {
        let combined = self.per_subject_batch_size() * self.subject_list().len();
        if combined == 0 {
            return 0;
        }
        self.samples_per_epoch() / combined
    }

    /// Optimizer steps over the whole run.
    pub fn total_steps(&self) -> usize {
        self.num_epochs * self.iterations_per_epoch()
    }

    /// Epochs trained in the mixup regime: `floor(mixup_pct * num_epochs)`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn mixup_epochs(&self) -> usize {
        (f64::from(self.mixup_pct) * self.num_epochs as f64).floor() as usize
    }

    /// Held-out trial count of the evaluated subject's full data set.
    pub fn expected_test_trials(&self) -> usize {
        let index = usize::from(self.eval_subject().clamp(1, NUM_SUBJECTS)) - 1;
        if self.new_test {
            NEW_TEST_TRIALS[index]
        } else {
            OLD_TEST_TRIALS[index]
        }
    }

    pub fn checkpoint_manager(&self) -> CheckpointManager {
        CheckpointManager::new(&self.output_dir, &self.model_name)
    }
}
