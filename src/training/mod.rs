//! Loss orchestration and the epoch loop.
//!
//! # Regimes
//!
//! Training runs in two regimes over the epoch index:
//!
//! 1. **Mixup** (`epoch < floor(mixup_pct * num_epochs)`): voxel sub-batches
//!    are interpolated with permuted partners and the contrastive term is the
//!    mixup-aware NCE at a fixed temperature
//! 2. **Soft** (remaining epochs): no corruption; the contrastive term is the
//!    symmetric soft-label CLIP loss whose temperature follows a cosine anneal
//!
//! The switch is a hard cut at the epoch boundary.
//!
//! # Step order
//!
//! augment → target embedding → projection + backbone → loss terms →
//! non-finite check → backward → gradient all-reduce → AdamW → record → LR step

use crate::checkpoint::{CheckpointManager, LoadOptions, LAST_TAG};
use crate::core::model::{BrainModel, ModelSpec, OutputGrads};
use crate::core::{normalize_rows, Gradients, NeuroError, NeuroResult};
use crate::data::{
    load_subjects, BatchAssembler, ImageStore, InMemoryImages, Subject, TrainingBatch,
};
use crate::distributed::{sync_gradients, Collective};
use crate::encoders::Encoders;
use crate::eval::{self, TestMetrics};
use crate::loss::{
    check_loss, cosine_anneal, pixcorr, retrieval_accuracy, BlurTargets, ClipFormulation,
    LossInputs, LossTerm, TermValue,
};
use crate::metrics::{write_summary, EpochReport, MetricsSink};
use crate::optim::{AdamW, LrScheduler};
use crate::{LrSchedulerKind, TrainConfig};
use ndarray::{Array4, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Contrastive temperature of the mixup regime.
pub const MIXCO_TEMP: f32 = 0.006;
/// Soft-CLIP temperature at the start of the soft regime.
pub const SOFT_TEMP_START: f32 = 0.004;
/// Soft-CLIP temperature at the end of the soft regime.
pub const SOFT_TEMP_END: f32 = 0.0075;

const EVAL_SEED_OFFSET: u64 = 0x5eed;

// ============================================================================
// Training state
// ============================================================================

/// Everything the epoch loop mutates, saved and restored as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    /// Next epoch to run
    pub epoch: usize,
    pub optimizer: AdamW,
    pub scheduler: LrScheduler,
    /// Total loss of every applied step
    pub train_losses: Vec<f32>,
    /// Test loss of every evaluation pass
    pub test_losses: Vec<f32>,
    /// Learning rate used by every applied step
    pub lrs: Vec<f32>,
    pub best_test_loss: Option<f32>,
}

impl TrainingState {
    pub fn new(optimizer: AdamW, scheduler: LrScheduler) -> Self {
        Self {
            epoch: 0,
            optimizer,
            scheduler,
            train_losses: Vec::new(),
            test_losses: Vec::new(),
            lrs: Vec::new(),
            best_test_loss: None,
        }
    }

    /// Fresh state with the configured optimizer and schedule.
    #[allow(clippy::cast_precision_loss)]
    pub fn for_config(config: &TrainConfig) -> Self {
        let total_steps = config.total_steps();
        let scheduler = match config.lr_scheduler_type {
            LrSchedulerKind::Linear => LrScheduler::linear(config.max_lr, total_steps),
            LrSchedulerKind::Cycle => {
                LrScheduler::one_cycle(config.max_lr, total_steps, 2.0 / config.num_epochs as f32)
            }
        };
        Self::new(AdamW::new(config.max_lr), scheduler)
    }

    /// Record a test loss; returns `true` if it is the best so far.
    pub fn record_test_loss(&mut self, loss: f32) -> bool {
        self.test_losses.push(loss);
        let improved = self.best_test_loss.map_or(true, |best| loss < best);
        if improved {
            self.best_test_loss = Some(loss);
        }
        improved
    }
}

/// Per-epoch running sums of loss terms and accuracy metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossAggregate {
    /// Applied optimizer steps
    pub steps: usize,
    /// Steps skipped for a non-finite loss on any worker
    pub aborted: usize,
    pub loss: f32,
    pub loss_clip: f32,
    pub loss_blurry: f32,
    pub loss_blurry_cont: f32,
    pub loss_prior: f32,
    pub recon_cossim: f32,
    pub recon_mse: f32,
    pub fwd_pct_correct: f32,
    pub bwd_pct_correct: f32,
    pub blurry_pixcorr: f32,
}

impl LossAggregate {
    pub fn record_term(&mut self, value: TermValue) {
        match value {
            TermValue::Prior { loss, cossim, mse } => {
                self.loss_prior += loss;
                self.recon_cossim += cossim;
                self.recon_mse += mse;
            }
            TermValue::Clip { loss } => self.loss_clip += loss,
            TermValue::Blur { l1, cont } => {
                self.loss_blurry += l1;
                self.loss_blurry_cont += cont;
            }
        }
    }

    /// Sum divided by the number of applied steps.
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self, total: f32) -> f32 {
        total / self.steps.max(1) as f32
    }

    /// Training half of the epoch report.
    pub fn report(&self, epoch: usize, state: &TrainingState, dropped: usize) -> EpochReport {
        EpochReport {
            epoch,
            train_loss: self.mean(self.loss),
            lr: state
                .lrs
                .last()
                .copied()
                .unwrap_or_else(|| state.scheduler.current_lr()),
            train_num_steps: state.train_losses.len(),
            test_num_steps: state.test_losses.len(),
            train_fwd_pct_correct: self.mean(self.fwd_pct_correct),
            train_bwd_pct_correct: self.mean(self.bwd_pct_correct),
            train_loss_clip: self.mean(self.loss_clip),
            train_loss_blurry: self.mean(self.loss_blurry),
            train_loss_blurry_cont: self.mean(self.loss_blurry_cont),
            train_blurry_pixcorr: self.mean(self.blurry_pixcorr),
            train_recon_cossim: self.mean(self.recon_cossim),
            train_recon_mse: self.mean(self.recon_mse),
            train_loss_prior: self.mean(self.loss_prior),
            dropped_batches: dropped,
            aborted_steps: self.aborted,
            ..EpochReport::default()
        }
    }
}

fn apply_test_metrics(report: &mut EpochReport, test: &TestMetrics, state: &TrainingState) {
    report.test_loss = test.loss;
    report.test_num_steps = state.test_losses.len();
    report.test_fwd_pct_correct = test.fwd_pct_correct;
    report.test_bwd_pct_correct = test.bwd_pct_correct;
    report.test_loss_clip = test.loss_clip;
    report.test_blurry_pixcorr = test.blurry_pixcorr;
    report.test_recon_cossim = test.recon_cossim;
    report.test_recon_mse = test.recon_mse;
    report.test_loss_prior = test.loss_prior;
}

// ============================================================================
// Staged contrastive schedule
// ============================================================================

/// Epoch-indexed choice between the mixup and soft regimes.
#[derive(Debug, Clone, PartialEq)]
pub struct ContrastiveSchedule {
    mixup_epochs: usize,
    soft_temps: Vec<f32>,
}

impl ContrastiveSchedule {
    pub fn new(num_epochs: usize, mixup_epochs: usize) -> Self {
        Self {
            mixup_epochs,
            soft_temps: cosine_anneal(
                SOFT_TEMP_START,
                SOFT_TEMP_END,
                num_epochs.saturating_sub(mixup_epochs),
            ),
        }
    }

    pub fn for_config(config: &TrainConfig) -> Self {
        Self::new(config.num_epochs, config.mixup_epochs())
    }

    pub fn mixup_epochs(&self) -> usize {
        self.mixup_epochs
    }

    pub fn uses_mixup(&self, epoch: usize) -> bool {
        epoch < self.mixup_epochs
    }

    /// Soft-CLIP temperature for an epoch of the soft regime.
    pub fn soft_temp(&self, epoch: usize) -> f32 {
        let index = epoch.saturating_sub(self.mixup_epochs);
        self.soft_temps
            .get(index)
            .or_else(|| self.soft_temps.last())
            .copied()
            .unwrap_or(SOFT_TEMP_START)
    }

    pub fn formulation(&self, epoch: usize) -> ClipFormulation {
        if self.uses_mixup(epoch) {
            ClipFormulation::Mixco { temp: MIXCO_TEMP }
        } else {
            ClipFormulation::SoftClip {
                temp: self.soft_temp(epoch),
            }
        }
    }
}

/// Loss terms enabled for an epoch, in evaluation order.
///
/// A term is left out when its scale is zero or its feature is switched off.
pub fn enabled_terms(
    config: &TrainConfig,
    schedule: &ContrastiveSchedule,
    has_prior: bool,
    epoch: usize,
) -> Vec<LossTerm> {
    let mut terms = Vec::with_capacity(3);
    if config.use_prior && has_prior && config.prior_scale > 0.0 {
        terms.push(LossTerm::Prior {
            scale: config.prior_scale,
        });
    }
    if config.clip_scale > 0.0 {
        terms.push(LossTerm::Clip {
            scale: config.clip_scale,
            formulation: schedule.formulation(epoch),
        });
    }
    if config.blurry_recon && config.blur_scale > 0.0 {
        terms.push(LossTerm::Blur {
            scale: config.blur_scale,
        });
    }
    terms
}

// ============================================================================
// Trainer
// ============================================================================

/// Outcome of one training iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// Parameters updated with the given total loss and learning rate
    Applied { loss: f32, lr: f32 },
    /// A worker saw a non-finite loss; nothing was updated
    Aborted,
}

/// One data-parallel worker's training loop.
pub struct Trainer {
    config: TrainConfig,
    model: BrainModel,
    state: TrainingState,
    subjects: Vec<Subject>,
    images: Arc<dyn ImageStore>,
    encoders: Encoders,
    collective: Box<dyn Collective>,
    assembler: BatchAssembler,
    schedule: ContrastiveSchedule,
    checkpoints: CheckpointManager,
    sink: Box<dyn MetricsSink>,
    parameter_shapes: Vec<(String, Vec<usize>)>,
    rng: ChaCha8Rng,
    eval_rng: ChaCha8Rng,
}

/// Everything [`Trainer::from_parts`] derives from the configuration that can fail.
struct Prepared {
    encoders: Encoders,
    model: BrainModel,
    state: TrainingState,
    checkpoints: CheckpointManager,
    schedule: ContrastiveSchedule,
    rank_seed: u64,
}

impl Prepared {
    fn new(
        config: &TrainConfig,
        subjects: &[Subject],
        images: &dyn ImageStore,
        collective: &dyn Collective,
    ) -> NeuroResult<Self> {
        config.validate()?;
        let ids: Vec<u8> = subjects.iter().map(|s| s.id).collect();
        if ids != config.subject_list() {
            return Err(NeuroError::InvalidConfig(format!(
                "loaded subjects {ids:?}, configuration trains on {:?}",
                config.subject_list()
            )));
        }
        if collective.world_size() != config.world_size {
            return Err(NeuroError::InvalidConfig(format!(
                "collective has {} workers, configuration expects {}",
                collective.world_size(),
                config.world_size
            )));
        }
        if let Some(eval_subject) = subjects.first() {
            let expected = config.expected_test_trials();
            if eval_subject.test.len() != expected {
                warn!(
                    subject = eval_subject.id,
                    found = eval_subject.test.len(),
                    expected,
                    "test split size differs from the full data set"
                );
            }
        }

        let encoders = Encoders::reference(
            images.image_shape(),
            config.clip_dim,
            config.perceptual_dim,
            config.latent_pool,
            config.seed,
        )?;
        let spec = ModelSpec {
            num_voxels: subjects.iter().map(|s| s.voxels.num_voxels()).collect(),
            hidden_dim: config.hidden_dim,
            n_blocks: config.n_blocks,
            clip_dim: config.clip_dim,
            latent_dim: config
                .blurry_recon
                .then(|| encoders.latent.latent_dim()),
            perceptual_dim: config.perceptual_dim,
            use_prior: config.use_prior,
        };
        // Every replica starts from the same weights.
        let mut model = BrainModel::new(&spec, &mut ChaCha8Rng::seed_from_u64(config.seed))?;
        let mut state = TrainingState::for_config(config);

        if let Some(dir) = &config.multisubject_ckpt {
            CheckpointManager::at(dir).load(
                LAST_TAG,
                LoadOptions::multisubject_transfer(),
                &mut model,
                &mut state,
            )?;
        }

        let checkpoints = config.checkpoint_manager();
        if config.resume {
            checkpoints.load(LAST_TAG, LoadOptions::default(), &mut model, &mut state)?;
        }
        checkpoints.save_config(config, collective)?;

        Ok(Self {
            encoders,
            model,
            state,
            checkpoints,
            schedule: ContrastiveSchedule::for_config(config),
            rank_seed: config.seed.wrapping_add(collective.rank() as u64),
        })
    }
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("model_name", &self.config.model_name)
            .field("rank", &self.collective.rank())
            .field("epoch", &self.state.epoch)
            .field("subjects", &self.subjects.iter().map(|s| s.id).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Trainer {
    /// Validate the configuration and load every input file, then build the trainer.
    ///
    /// # Errors
    /// - `InvalidConfig` on a bad option
    /// - `MissingData` / `Format` on absent or malformed data files
    /// - checkpoint errors when fine-tuning or resuming
    pub fn setup(
        config: TrainConfig,
        collective: Box<dyn Collective>,
        sink: Box<dyn MetricsSink>,
    ) -> NeuroResult<Self> {
        config.validate()?;
        let images = InMemoryImages::load(&config.data_path.join("images.json"))?;
        let subjects = load_subjects(
            &config.data_path,
            &config.subject_requests(),
            config.test_split(),
            images.len(),
        )?;
        Self::from_parts(config, subjects, Arc::new(images), collective, sink)
    }

    /// Build a trainer over already loaded data.
    ///
    /// Subjects must be given in [`TrainConfig::subject_list`] order; the
    /// first one is evaluated.
    ///
    /// # Errors
    /// - `InvalidConfig` if the configuration, subject list or worker count is inconsistent
    /// - checkpoint errors when fine-tuning or resuming
    pub fn from_parts(
        config: TrainConfig,
        subjects: Vec<Subject>,
        images: Arc<dyn ImageStore>,
        collective: Box<dyn Collective>,
        sink: Box<dyn MetricsSink>,
    ) -> NeuroResult<Self> {
        let prepared = match Prepared::new(&config, &subjects, images.as_ref(), collective.as_ref())
        {
            Ok(prepared) => prepared,
            Err(e) => {
                collective.abort(&e.to_string());
                return Err(e);
            }
        };
        let Prepared {
            encoders,
            model,
            state,
            checkpoints,
            schedule,
            rank_seed,
        } = prepared;
        let assembler = BatchAssembler::new(&subjects, config.per_subject_batch_size(), rank_seed);

        info!(
            rank = collective.rank(),
            subjects = ?subjects.iter().map(|s| s.id).collect::<Vec<_>>(),
            parameters = model.num_parameters(),
            iterations_per_epoch = config.iterations_per_epoch(),
            total_steps = config.total_steps(),
            mixup_epochs = schedule.mixup_epochs(),
            "trainer ready"
        );

        Ok(Self {
            parameter_shapes: model.parameter_shapes(),
            rng: ChaCha8Rng::seed_from_u64(rank_seed),
            eval_rng: ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(EVAL_SEED_OFFSET)),
            config,
            model,
            state,
            subjects,
            images,
            encoders,
            collective,
            assembler,
            schedule,
            checkpoints,
            sink,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn model(&self) -> &BrainModel {
        &self.model
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    pub fn schedule(&self) -> &ContrastiveSchedule {
        &self.schedule
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Run one training iteration on a preloaded batch.
    ///
    /// # Algorithm
    /// 1. Optionally augment the images and embed them as contrastive targets
    /// 2. Project each subject slice and run the backbone
    /// 3. Compute every enabled term, accumulating weighted output gradients
    /// 4. If the total loss is not finite, log it and vote to abort
    /// 5. Backpropagate, then average gradients and the abort vote across workers
    /// 6. Step AdamW at the scheduler's learning rate, record, advance the schedule
    ///
    /// # Errors
    /// Returns `Err` on shape mismatches, encoder failures or collective failures.
    /// A non-finite loss is not an error: it yields [`StepOutcome::Aborted`].
    pub fn train_step(
        &mut self,
        batch: &TrainingBatch,
        epoch: usize,
        iteration: usize,
        terms: &[LossTerm],
        aggregate: &mut LossAggregate,
    ) -> NeuroResult<StepOutcome> {
        let augmented: Array4<f32>;
        let images = if self.config.use_image_aug {
            augmented = self.encoders.train_aug.augment(&batch.images, &mut self.rng);
            &augmented
        } else {
            &batch.images
        };
        let clip_target = self.encoders.clip.embed(images)?;

        let (outputs, cache) = self.model.forward(&batch.slices())?;

        let wants_blur = terms.iter().any(|t| matches!(t, LossTerm::Blur { .. }));
        let blur_targets = if wants_blur {
            let strong = self.encoders.blur_aug.augment(images, &mut self.rng);
            Some(BlurTargets {
                latent: self.encoders.latent.encode(images)?,
                perceptual: self.encoders.perceptual.embed_perceptual(images)?,
                perceptual_aug: self.encoders.perceptual.embed_perceptual(&strong)?,
            })
        } else {
            None
        };

        let inputs = LossInputs {
            clip_target: &clip_target,
            mixup: batch.mixup.as_ref(),
            blur: blur_targets.as_ref(),
            prior: self.model.diffusion_prior.as_ref(),
        };
        let mut output_grads = OutputGrads::zeros_like(&outputs);
        let mut grads = Gradients::new();
        let mut total = 0.0;
        let mut values = Vec::with_capacity(terms.len());
        for term in terms {
            let outcome =
                term.compute(&inputs, &outputs, &mut output_grads, &mut grads, &mut self.rng)?;
            total += outcome.weighted;
            values.push(outcome.value);
        }

        let local_abort = match check_loss(total, epoch, iteration) {
            Ok(()) => {
                grads.extend(self.model.backward(&cache, &output_grads)?)?;
                false
            }
            Err(e) => {
                error!(epoch, iteration, rank = self.collective.rank(), error = %e, "aborting step");
                grads = Gradients::new();
                true
            }
        };

        let aborted = sync_gradients(
            self.collective.as_ref(),
            &mut grads,
            &self.parameter_shapes,
            local_abort,
        )?;
        if aborted {
            aggregate.aborted += 1;
            return Ok(StepOutcome::Aborted);
        }

        let lr = self.state.scheduler.current_lr();
        self.state.optimizer.lr = lr;
        self.state.optimizer.step(&mut self.model, &grads)?;
        self.state.train_losses.push(total);
        self.state.lrs.push(lr);
        self.state.scheduler.step();

        aggregate.steps += 1;
        aggregate.loss += total;
        for value in values {
            aggregate.record_term(value);
        }
        let (preds, _) = normalize_rows(&outputs.clip);
        let (targets, _) = normalize_rows(&clip_target);
        let (fwd, bwd) = retrieval_accuracy(&preds, &targets);
        aggregate.fwd_pct_correct += fwd;
        aggregate.bwd_pct_correct += bwd;

        if let (true, Some(blur)) = (wants_blur, outputs.blur.as_ref()) {
            let subset = eval::eval_subset(batch.len(), &mut self.rng);
            let recon = self
                .encoders
                .latent
                .decode(&blur.latent.select(Axis(0), &subset))?;
            aggregate.blurry_pixcorr += pixcorr(&images.select(Axis(0), &subset), &recon)?;
        }

        debug!(epoch, iteration, loss = total, lr, "step");
        Ok(StepOutcome::Applied { loss: total, lr })
    }

    /// Preload and train one epoch, then evaluate, report and checkpoint on rank zero.
    ///
    /// Every worker waits at a barrier before returning. A worker that fails
    /// aborts the group so its peers return an error instead of waiting.
    ///
    /// # Errors
    /// Propagates data, step, evaluation I/O and checkpoint errors.
    pub fn run_epoch(&mut self, epoch: usize) -> NeuroResult<EpochReport> {
        let result = self.train_and_report(epoch);
        self.abort_on_error(result)
    }

    fn abort_on_error<T>(&self, result: NeuroResult<T>) -> NeuroResult<T> {
        if let Err(e) = &result {
            self.collective.abort(&e.to_string());
        }
        result
    }

    fn train_and_report(&mut self, epoch: usize) -> NeuroResult<EpochReport> {
        let mixup = self.schedule.uses_mixup(epoch);
        let terms = enabled_terms(
            &self.config,
            &self.schedule,
            self.model.diffusion_prior.is_some(),
            epoch,
        );
        let preloaded = self.assembler.assemble_epoch(
            &self.subjects,
            self.images.as_ref(),
            self.config.iterations_per_epoch(),
            mixup,
            &mut self.rng,
        )?;

        let mut aggregate = LossAggregate::default();
        for (iteration, batch) in preloaded.batches.iter().enumerate() {
            self.train_step(batch, epoch, iteration, &terms, &mut aggregate)?;
        }
        self.state.epoch = epoch + 1;
        let mut report = aggregate.report(epoch, &self.state, preloaded.dropped);

        if self.collective.is_main_process() {
            self.evaluate_into(epoch, &mut report)?;
            self.sink.record(&report)?;
            info!(
                epoch,
                train_loss = report.train_loss,
                test_loss = report.test_loss,
                fwd = report.test_fwd_pct_correct,
                bwd = report.test_bwd_pct_correct,
                lr = report.lr,
                dropped = report.dropped_batches,
                "epoch complete"
            );
            if self.config.ckpt_saving && epoch % self.config.ckpt_interval == 0 {
                self.save(&format!("ckpt_{epoch}"))?;
                self.save(LAST_TAG)?;
            }
        }
        self.collective.barrier()?;
        Ok(report)
    }

    fn evaluate_into(&mut self, epoch: usize, report: &mut EpochReport) -> NeuroResult<()> {
        let Some(subject) = self.subjects.first() else {
            return Ok(());
        };
        match eval::evaluate(
            &self.model,
            subject,
            0,
            self.images.as_ref(),
            &self.encoders,
            &self.config,
            epoch,
            &mut self.eval_rng,
        ) {
            Ok(test) => {
                if self.state.record_test_loss(test.loss) {
                    debug!(epoch, loss = test.loss, "new best test loss");
                }
                apply_test_metrics(report, &test, &self.state);
                Ok(())
            }
            Err(e @ NeuroError::NonFiniteLoss { .. }) => {
                error!(epoch, error = %e, "evaluation produced a non-finite loss");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Save the full state under `tag` (rank zero only).
    pub fn save(&self, tag: &str) -> NeuroResult<()> {
        self.checkpoints
            .save(tag, &self.model, &self.state, self.collective.as_ref())?;
        Ok(())
    }

    /// Train from the current epoch to the configured end.
    ///
    /// Returns this worker's epoch reports; only rank zero's carry test metrics.
    ///
    /// # Errors
    /// Propagates any error from [`Trainer::run_epoch`] or the final save.
    pub fn fit(&mut self) -> NeuroResult<Vec<EpochReport>> {
        let start = self.state.epoch;
        info!(
            rank = self.collective.rank(),
            start,
            num_epochs = self.config.num_epochs,
            "starting training"
        );
        let mut reports = Vec::with_capacity(self.config.num_epochs.saturating_sub(start));
        for epoch in start..self.config.num_epochs {
            reports.push(self.run_epoch(epoch)?);
        }

        let finished = self.finish(reports.last());
        self.abort_on_error(finished)?;
        info!(rank = self.collective.rank(), "training finished");
        Ok(reports)
    }

    fn finish(&self, last: Option<&EpochReport>) -> NeuroResult<()> {
        if self.collective.is_main_process() {
            if self.config.ckpt_saving {
                self.save(LAST_TAG)?;
            }
            if let Some(last) = last {
                write_summary(&self.checkpoints.dir().join("summary.json"), last)?;
            }
        }
        self.collective.barrier()
    }
}
