//! End-to-end tests for the training pipeline.
//!
//! These tests verify whole-pipeline behavior:
//! - Preloaded sub-batches never repeat an image
//! - A tiny run trains, evaluates, reports and checkpoints
//! - Checkpoints restore epoch, learning rate and model outputs
//! - The contrastive regime switches exactly at the mixup boundary
//! - Test evaluation averages repeats exactly
//! - Multi-subject checkpoints transfer into single-subject runs
//! - A non-finite loss skips the update entirely
//! - A failing worker releases its peers instead of deadlocking them

use approx::assert_abs_diff_eq;
use ndarray::{Array, Array2, Array4};
use neuroclip::checkpoint::{LoadOptions, LAST_TAG};
use neuroclip::core::model::{OutputGrads, SubjectSlice};
use neuroclip::core::{normalize_rows, Gradients, TensorRecord};
use neuroclip::data::{
    BatchAssembler, CorruptionDescriptors, ImageStore, InMemoryImages, Subject, SubjectPart,
    Trial, TrainingBatch, TrialStream, VoxelStore,
};
use neuroclip::eval::{average_repeats, group_repeats};
use neuroclip::loss::{mixco_nce, soft_clip_loss, ClipFormulation, LossInputs, LossTerm, TermValue};
use neuroclip::training::{enabled_terms, ContrastiveSchedule, StepOutcome};
use neuroclip::{
    BackboneOutput, BrainModel, CheckpointManager, Collective, EpochReport, JsonlSink,
    LossAggregate, MetricsSink, ModelSpec, NeuroError, NeuroResult, SingleProcess, ThreadGroup,
    TrainConfig, Trainer, TrainingState,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const NUM_VOXELS: usize = 6;

fn trial(image_index: usize, voxel_index: usize) -> Trial {
    Trial {
        image_index,
        voxel_index,
        session: 0,
        repeat: 0,
    }
}

/// Four presentations of two images: each image shown twice.
fn tiny_trials() -> Vec<Trial> {
    vec![trial(0, 0), trial(1, 1), trial(0, 2), trial(1, 3)]
}

fn tiny_images(n: usize) -> Array4<f32> {
    Array::from_shape_fn((n, 3, 8, 8), |(i, c, h, w)| {
        ((i * 7 + c * 3 + h * 2 + w) as f32 * 0.37).sin() * 0.5 + 0.5
    })
}

fn tiny_voxels(rows: usize) -> Array2<f32> {
    Array::from_shape_fn((rows, NUM_VOXELS), |(r, c)| ((r * NUM_VOXELS + c) as f32 * 0.61).cos())
}

fn tiny_subject(id: u8) -> Subject {
    Subject {
        id,
        voxels: VoxelStore::new(tiny_voxels(4)),
        train: tiny_trials(),
        test: tiny_trials(),
    }
}

fn tiny_config(root: &Path) -> TrainConfig {
    TrainConfig {
        model_name: "tiny".to_string(),
        data_path: root.join("data"),
        output_dir: root.join("runs"),
        subject: 1,
        num_sessions: 1,
        use_prior: false,
        blurry_recon: false,
        clip_scale: 1.0,
        batch_size: 2,
        num_epochs: 1,
        samples_per_epoch: Some(2),
        n_blocks: 1,
        hidden_dim: 16,
        clip_dim: 8,
        perceptual_dim: 4,
        latent_pool: 4,
        ..TrainConfig::default()
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) {
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, serde_json::to_vec(value).expect("serialize")).expect("write");
}

fn write_trials(path: &Path, trials: &[Trial]) {
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    let mut file = fs::File::create(path).expect("create");
    for t in trials {
        writeln!(file, "{}", serde_json::to_string(t).expect("serialize")).expect("write");
    }
}

/// Lay out the single-subject data set on disk.
fn write_tiny_dataset(data: &Path) {
    write_json(
        &data.join("images.json"),
        &TensorRecord::from_view(&tiny_images(2).into_dyn().view()),
    );
    write_json(
        &data.join("betas_subj01.json"),
        &TensorRecord::from_view(&tiny_voxels(4).into_dyn().view()),
    );
    write_trials(&data.join("subj01").join("train.jsonl"), &tiny_trials());
    write_trials(&data.join("subj01").join("new_test.jsonl"), &tiny_trials());
}

fn run_tiny(root: &Path) -> (Trainer, Vec<EpochReport>) {
    let config = tiny_config(root);
    write_tiny_dataset(&config.data_path);
    let sink = JsonlSink::new(config.checkpoint_manager().dir().join("metrics.jsonl"));
    let mut trainer =
        Trainer::setup(config, Box::new(SingleProcess), Box::new(sink)).expect("setup");
    let reports = trainer.fit().expect("fit");
    (trainer, reports)
}

#[test]
fn test_end_to_end_single_iteration() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (trainer, reports) = run_tiny(dir.path());

    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert!(report.train_loss.is_finite());
    assert!(report.test_loss.is_finite());
    assert_eq!(trainer.state().optimizer.step_count(), 1);
    assert_eq!(trainer.state().train_losses.len(), 1);
    assert_eq!(report.train_num_steps, 1);
    assert_eq!(report.test_num_steps, 1);
    for acc in [
        report.train_fwd_pct_correct,
        report.train_bwd_pct_correct,
        report.test_fwd_pct_correct,
        report.test_bwd_pct_correct,
    ] {
        assert!((0.0..=1.0).contains(&acc), "accuracy {acc} out of range");
    }
    assert_eq!(report.aborted_steps, 0);

    let run_dir = trainer.checkpoints().dir();
    assert!(run_dir.join("last.json").exists());
    assert!(run_dir.join("ckpt_0.json").exists());
    assert!(run_dir.join("config.json").exists());
    let logged = JsonlSink::new(run_dir.join("metrics.jsonl"))
        .read_all()
        .expect("metrics");
    assert_eq!(logged, reports);
}

#[test]
fn test_checkpoint_round_trip_restores_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (trainer, _) = run_tiny(dir.path());
    let config = trainer.config().clone();

    let spec = ModelSpec {
        num_voxels: vec![NUM_VOXELS],
        hidden_dim: config.hidden_dim,
        n_blocks: config.n_blocks,
        clip_dim: config.clip_dim,
        latent_dim: None,
        perceptual_dim: config.perceptual_dim,
        use_prior: false,
    };
    let mut model = BrainModel::new(&spec, &mut ChaCha8Rng::seed_from_u64(99)).expect("model");
    let mut state = TrainingState::for_config(&config);
    trainer
        .checkpoints()
        .load(LAST_TAG, LoadOptions::default(), &mut model, &mut state)
        .expect("load");

    assert_eq!(state.epoch, trainer.state().epoch);
    assert_eq!(state.epoch, 1);
    assert_abs_diff_eq!(state.optimizer.lr, trainer.state().optimizer.lr);
    assert_eq!(state.optimizer.step_count(), 1);
    assert_eq!(state.lrs, trainer.state().lrs);

    let probe = tiny_voxels(3);
    let expected = trainer.model().forward_subject(&probe, 0).expect("forward");
    let restored = model.forward_subject(&probe, 0).expect("forward");
    for (a, b) in expected.clip.iter().zip(restored.clip.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
    }
}

#[test]
fn test_resume_continues_from_saved_epoch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (trainer, _) = run_tiny(dir.path());
    let config = TrainConfig {
        resume: true,
        num_epochs: 2,
        ..trainer.config().clone()
    };
    let mut resumed =
        Trainer::setup(config, Box::new(SingleProcess), Box::new(Vec::new())).expect("setup");
    assert_eq!(resumed.state().epoch, 1);
    assert_eq!(resumed.state().optimizer.step_count(), 1);
    let reports = resumed.fit().expect("fit");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].epoch, 1);
    assert_eq!(resumed.state().train_losses.len(), 2);
}

#[test]
fn test_resume_without_checkpoint_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = TrainConfig {
        resume: true,
        ..tiny_config(dir.path())
    };
    write_tiny_dataset(&config.data_path);
    let err = Trainer::setup(config, Box::new(SingleProcess), Box::new(Vec::new()))
        .expect_err("no checkpoint");
    assert!(matches!(err, NeuroError::MissingCheckpoint { .. }));
}

#[test]
fn test_missing_data_fails_before_training() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = tiny_config(dir.path());
    let err = Trainer::setup(config, Box::new(SingleProcess), Box::new(Vec::new()))
        .expect_err("missing data");
    assert!(matches!(err, NeuroError::MissingData { .. }));
}

#[test]
fn test_assembled_batches_never_repeat_images() {
    let trials: Vec<Trial> = (0..24).map(|v| trial(v % 5, v)).collect();
    let subjects = vec![
        Subject {
            id: 1,
            voxels: VoxelStore::new(Array::from_shape_fn((24, 4), |(r, c)| (r + c) as f32)),
            train: trials.clone(),
            test: Vec::new(),
        },
        Subject {
            id: 2,
            voxels: VoxelStore::new(Array::from_shape_fn((24, 3), |(r, c)| (r * c) as f32)),
            train: trials,
            test: Vec::new(),
        },
    ];
    let images = InMemoryImages::new(tiny_images(5));
    let mut assembler = BatchAssembler::new(&subjects, 3, 11);
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    for mixup in [true, false] {
        let epoch = assembler
            .assemble_epoch(&subjects, &images, 6, mixup, &mut rng)
            .expect("epoch");
        assert_eq!(epoch.batches.len(), 6);
        for batch in &epoch.batches {
            assert_eq!(batch.parts.len(), 2);
            for part in &batch.parts {
                let mut unique = part.image_indices.clone();
                unique.sort_unstable();
                unique.dedup();
                assert_eq!(unique.len(), part.image_indices.len());
            }
            assert_eq!(batch.images.dim().0, 6);
            assert_eq!(batch.mixup.is_some(), mixup);
        }
    }
}

#[test]
fn test_single_pass_streams_limit_the_epoch() {
    let subjects = vec![tiny_subject(1)];
    let images = InMemoryImages::new(tiny_images(2));
    let mut assembler =
        BatchAssembler::from_streams(vec![TrialStream::new(tiny_trials(), 2, false, 0)]);
    let epoch = assembler
        .assemble_epoch(&subjects, &images, 5, false, &mut ChaCha8Rng::seed_from_u64(0))
        .expect("epoch");
    assert!(epoch.batches.len() <= 2);
    assert_eq!(epoch.quota, 5);
}

#[test]
fn test_regime_switch_is_exact() {
    let config = TrainConfig {
        num_epochs: 10,
        mixup_pct: 0.3,
        ..TrainConfig::default()
    };
    let schedule = ContrastiveSchedule::for_config(&config);
    let boundary = config.mixup_epochs();
    assert_eq!(boundary, 3);

    let preds = Array::from_shape_fn((4, 5), |(i, j)| ((i * 5 + j) as f32 * 0.9).sin());
    let targets = Array::from_shape_fn((4, 5), |(i, j)| ((i + 3 * j) as f32 * 0.4).cos());
    let outputs = BackboneOutput {
        conditioning: Array2::zeros((4, 16)),
        clip: preds.clone(),
        blur: None,
    };
    let mixup = CorruptionDescriptors {
        perm: vec![1, 0, 3, 2],
        betas: vec![0.3, 1.0, 0.6, 1.0],
        select: vec![true, false, true, false],
    };
    let inputs = LossInputs {
        clip_target: &targets,
        mixup: Some(&mixup),
        blur: None,
        prior: None,
    };
    let (p, _) = normalize_rows(&preds);
    let (t, _) = normalize_rows(&targets);

    let clip_loss_at = |epoch: usize| {
        let term = LossTerm::Clip {
            scale: 1.0,
            formulation: schedule.formulation(epoch),
        };
        let mut grads = OutputGrads::zeros_like(&outputs);
        let outcome = term
            .compute(
                &inputs,
                &outputs,
                &mut grads,
                &mut Gradients::new(),
                &mut ChaCha8Rng::seed_from_u64(0),
            )
            .expect("term");
        match outcome.value {
            TermValue::Clip { loss } => loss,
            other => panic!("unexpected term value {other:?}"),
        }
    };

    let before = clip_loss_at(boundary - 1);
    let after = clip_loss_at(boundary);
    let ClipFormulation::Mixco { temp } = schedule.formulation(boundary - 1) else {
        panic!("last mixup epoch must use the mixup formulation");
    };
    let (expected_mixco, _) = mixco_nce(&p, &t, temp, &mixup).expect("mixco");
    let ClipFormulation::SoftClip { temp } = schedule.formulation(boundary) else {
        panic!("first soft epoch must use the soft formulation");
    };
    let (expected_soft, _) = soft_clip_loss(&p, &t, temp);

    assert_abs_diff_eq!(before, expected_mixco, epsilon = 1e-5);
    assert_abs_diff_eq!(after, expected_soft, epsilon = 1e-5);
    assert!((before - after).abs() > 1e-3);
}

#[test]
fn test_evaluation_averages_repeats_exactly() {
    let spec = ModelSpec {
        num_voxels: vec![NUM_VOXELS],
        hidden_dim: 8,
        n_blocks: 1,
        clip_dim: 4,
        latent_dim: None,
        perceptual_dim: 3,
        use_prior: false,
    };
    let model = BrainModel::new(&spec, &mut ChaCha8Rng::seed_from_u64(4)).expect("model");
    let voxels = tiny_voxels(3);
    let outputs: Vec<BackboneOutput> = (0..3)
        .map(|r| {
            model
                .forward_subject(&voxels.select(ndarray::Axis(0), &[r]), 0)
                .expect("forward")
        })
        .collect();
    let averaged = average_repeats(&outputs).expect("average");
    let expected = (&outputs[0].clip + &outputs[1].clip + &outputs[2].clip) / 3.0;
    assert_eq!(averaged.clip, expected);

    let groups = group_repeats(&tiny_trials());
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].voxel_rows, [0, 2, 0]);
    assert_eq!(groups[1].voxel_rows, [1, 3, 1]);
}

#[test]
fn test_multisubject_checkpoint_transfers_without_projection_weight() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = TrainConfig {
        multisubject_ckpt: Some(dir.path().join("runs").join("multi")),
        ..tiny_config(dir.path())
    };
    let spec = |num_voxels: Vec<usize>| ModelSpec {
        num_voxels,
        hidden_dim: config.hidden_dim,
        n_blocks: config.n_blocks,
        clip_dim: config.clip_dim,
        latent_dim: None,
        perceptual_dim: config.perceptual_dim,
        use_prior: false,
    };

    let multi = BrainModel::new(&spec(vec![NUM_VOXELS, NUM_VOXELS]), &mut ChaCha8Rng::seed_from_u64(77))
        .expect("model");
    CheckpointManager::at(dir.path().join("runs").join("multi"))
        .save(
            LAST_TAG,
            &multi,
            &TrainingState::for_config(&config),
            &SingleProcess,
        )
        .expect("save");

    let fresh = BrainModel::new(&spec(vec![NUM_VOXELS]), &mut ChaCha8Rng::seed_from_u64(config.seed))
        .expect("model");
    let images: Arc<dyn ImageStore> = Arc::new(InMemoryImages::new(tiny_images(2)));
    let trainer = Trainer::from_parts(
        config,
        vec![tiny_subject(1)],
        images,
        Box::new(SingleProcess),
        Box::new(Vec::new()),
    )
    .expect("compatibility load must not raise");

    let loaded = &trainer.model().ridge.linears[0];
    assert_eq!(loaded.weight, fresh.ridge.linears[0].weight);
    assert_ne!(loaded.weight, multi.ridge.linears[0].weight);
    assert_eq!(loaded.bias, multi.ridge.linears[0].bias);
    assert_eq!(trainer.model().backbone, multi.backbone);
    assert_eq!(trainer.state().epoch, 0);
}

#[test]
fn test_thread_group_replicas_stay_identical() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = TrainConfig {
        world_size: 2,
        ckpt_saving: false,
        ..tiny_config(dir.path())
    };
    let handles = ThreadGroup::new(2).expect("group");
    let models: Vec<BrainModel> = handles
        .into_iter()
        .map(|handle| {
            let config = config.clone();
            thread::spawn(move || {
                let images: Arc<dyn ImageStore> = Arc::new(InMemoryImages::new(tiny_images(2)));
                let mut trainer = Trainer::from_parts(
                    config,
                    vec![tiny_subject(1)],
                    images,
                    Box::new(handle),
                    Box::new(Vec::new()),
                )
                .expect("trainer");
                trainer.fit().expect("fit");
                trainer.model().clone()
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|t| t.join().expect("join"))
        .collect();
    assert_eq!(models[0], models[1]);
    assert!(!dir.path().join("runs").join("tiny").join("last.json").exists());
}

#[test]
fn test_subject_slices_route_to_their_projection() {
    let spec = ModelSpec {
        num_voxels: vec![4, 3],
        hidden_dim: 8,
        n_blocks: 1,
        clip_dim: 4,
        latent_dim: None,
        perceptual_dim: 3,
        use_prior: false,
    };
    let model = BrainModel::new(&spec, &mut ChaCha8Rng::seed_from_u64(2)).expect("model");
    let a = Array::from_shape_fn((2, 4), |(i, j)| (i + j) as f32);
    let b = Array::from_shape_fn((3, 3), |(i, j)| (i * j) as f32);
    let (combined, _) = model
        .forward(&[
            SubjectSlice { slot: 0, voxels: &a },
            SubjectSlice { slot: 1, voxels: &b },
        ])
        .expect("forward");
    assert_eq!(combined.clip.nrows(), 5);
    let alone = model.forward_subject(&b, 1).expect("forward");
    for (x, y) in combined
        .clip
        .slice(ndarray::s![2.., ..])
        .iter()
        .zip(alone.clip.iter())
    {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-6);
    }
}

#[test]
fn test_non_finite_loss_skips_the_update() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = tiny_config(dir.path());
    let images: Arc<dyn ImageStore> = Arc::new(InMemoryImages::new(tiny_images(2)));
    let mut trainer = Trainer::from_parts(
        config,
        vec![tiny_subject(1)],
        images,
        Box::new(SingleProcess),
        Box::new(Vec::new()),
    )
    .expect("trainer");

    let batch = TrainingBatch {
        parts: vec![SubjectPart {
            slot: 0,
            subject: 1,
            image_indices: vec![0, 1],
            voxels: Array2::from_elem((2, NUM_VOXELS), f32::NAN),
        }],
        images: tiny_images(2),
        mixup: None,
    };
    let terms = enabled_terms(trainer.config(), trainer.schedule(), false, 0);
    let before = trainer.model().clone();
    let mut aggregate = LossAggregate::default();

    let outcome = trainer
        .train_step(&batch, 0, 0, &terms, &mut aggregate)
        .expect("an aborted step is not an error");

    assert!(matches!(outcome, StepOutcome::Aborted));
    assert_eq!(trainer.state().optimizer.step_count(), 0);
    assert_eq!(trainer.state().scheduler.last_step, 0);
    assert!(trainer.state().train_losses.is_empty());
    assert_eq!(*trainer.model(), before);
    let report = aggregate.report(0, trainer.state(), 0);
    assert_eq!(report.aborted_steps, 1);
    assert_eq!(report.train_num_steps, 0);
}

/// Sink that refuses every record.
struct UnavailableSink;

impl MetricsSink for UnavailableSink {
    fn record(&mut self, _report: &EpochReport) -> NeuroResult<()> {
        Err(NeuroError::Format("metrics store unavailable".to_string()))
    }
}

#[test]
fn test_main_worker_failure_releases_peers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = TrainConfig {
        world_size: 2,
        num_epochs: 2,
        ckpt_saving: false,
        ..tiny_config(dir.path())
    };
    let (done, finished) = mpsc::channel();
    for handle in ThreadGroup::new(2).expect("group") {
        let config = config.clone();
        let done = done.clone();
        thread::spawn(move || {
            let rank = handle.rank();
            let sink: Box<dyn MetricsSink> = if rank == 0 {
                Box::new(UnavailableSink)
            } else {
                Box::new(Vec::new())
            };
            let images: Arc<dyn ImageStore> = Arc::new(InMemoryImages::new(tiny_images(2)));
            let result = Trainer::from_parts(
                config,
                vec![tiny_subject(1)],
                images,
                Box::new(handle),
                sink,
            )
            .and_then(|mut trainer| trainer.fit());
            // the receiver may already have given up
            let _ = done.send((rank, result.is_err()));
        });
    }
    drop(done);

    let mut outcomes: Vec<(usize, bool)> = (0..2)
        .map(|_| {
            finished
                .recv_timeout(Duration::from_secs(60))
                .expect("every worker returns")
        })
        .collect();
    outcomes.sort_unstable();
    assert_eq!(outcomes, vec![(0, true), (1, true)]);
}
