//! neuroclip training binary.
//!
//! Trains the voxel-to-embedding model on a prepared data directory and
//! writes checkpoints plus JSONL metrics under `<output_dir>/<model_name>/`.

use clap::Parser;
use neuroclip::{
    Collective, JsonlSink, LrSchedulerKind, MetricsSink, NeuroError, NeuroResult, SingleProcess,
    ThreadGroup, TrainConfig, Trainer,
};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "neuroclip-train",
    about = "Train a voxel-to-image-embedding model"
)]
struct Args {
    /// JSON configuration file; command-line options override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data root holding images.json, betas_subj0*.json and subj0*/ trial files
    #[arg(long)]
    data_path: Option<PathBuf>,

    /// Checkpoint root
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Run name
    #[arg(long)]
    model_name: Option<String>,

    /// Subject id (1-8); held out in multi-subject mode
    #[arg(long)]
    subject: Option<u8>,

    /// Sessions of training data
    #[arg(long)]
    num_sessions: Option<usize>,

    /// Train on every subject except --subject
    #[arg(long)]
    multi_subject: bool,

    /// Multi-subject run directory to fine-tune from
    #[arg(long)]
    multisubject_ckpt: Option<PathBuf>,

    /// Disable the diffusion-prior loss
    #[arg(long)]
    no_prior: bool,

    /// Disable the blurry reconstruction head and losses
    #[arg(long)]
    no_blurry_recon: bool,

    /// Augment training images before embedding
    #[arg(long)]
    use_image_aug: bool,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    num_epochs: Option<usize>,

    #[arg(long)]
    mixup_pct: Option<f32>,

    #[arg(long)]
    blur_scale: Option<f32>,

    #[arg(long)]
    clip_scale: Option<f32>,

    #[arg(long)]
    prior_scale: Option<f32>,

    /// Learning-rate schedule: cycle or linear
    #[arg(long, value_parser = parse_scheduler)]
    lr_scheduler_type: Option<LrSchedulerKind>,

    #[arg(long)]
    max_lr: Option<f32>,

    /// Evaluate on the old held-out split
    #[arg(long)]
    old_test: bool,

    /// Epochs between checkpoints
    #[arg(long)]
    ckpt_interval: Option<usize>,

    /// Do not write checkpoints
    #[arg(long)]
    no_ckpt_saving: bool,

    /// Resume from the last checkpoint of this run
    #[arg(long)]
    resume: bool,

    #[arg(long)]
    seed: Option<u64>,

    /// Data-parallel workers, one thread each
    #[arg(long, default_value_t = 1)]
    workers: usize,
}

fn parse_scheduler(value: &str) -> Result<LrSchedulerKind, String> {
    match value {
        "cycle" => Ok(LrSchedulerKind::Cycle),
        "linear" => Ok(LrSchedulerKind::Linear),
        other => Err(format!("unknown scheduler '{other}', expected cycle or linear")),
    }
}

fn load_config(args: &Args) -> NeuroResult<TrainConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let file = File::open(path).map_err(|e| NeuroError::io(path, e))?;
            serde_json::from_reader(BufReader::new(file))
                .map_err(|e| NeuroError::Format(format!("{}: {e}", path.display())))?
        }
        None => TrainConfig::default(),
    };

    macro_rules! override_with {
        ($($field:ident),*) => {
            $(if let Some(value) = args.$field.clone() {
                config.$field = value;
            })*
        };
    }
    override_with!(
        data_path,
        output_dir,
        model_name,
        subject,
        num_sessions,
        batch_size,
        num_epochs,
        mixup_pct,
        blur_scale,
        clip_scale,
        prior_scale,
        lr_scheduler_type,
        max_lr,
        ckpt_interval,
        seed
    );
    if args.multisubject_ckpt.is_some() {
        config.multisubject_ckpt = args.multisubject_ckpt.clone();
    }
    config.multi_subject |= args.multi_subject;
    config.use_prior &= !args.no_prior;
    config.blurry_recon &= !args.no_blurry_recon;
    config.use_image_aug |= args.use_image_aug;
    config.new_test &= !args.old_test;
    config.ckpt_saving &= !args.no_ckpt_saving;
    config.resume |= args.resume;
    config.world_size = args.workers;
    config.validate()?;
    Ok(config)
}

fn train_worker(config: TrainConfig, collective: Box<dyn Collective>) -> NeuroResult<()> {
    let sink: Box<dyn MetricsSink> = if collective.is_main_process() {
        Box::new(JsonlSink::new(
            config.checkpoint_manager().dir().join("metrics.jsonl"),
        ))
    } else {
        Box::new(Vec::new())
    };
    let mut trainer = Trainer::setup(config, collective, sink)?;
    trainer.fit()?;
    Ok(())
}

fn run(args: &Args) -> NeuroResult<()> {
    let config = load_config(args)?;
    info!(
        model_name = %config.model_name,
        subjects = ?config.subject_list(),
        workers = config.world_size,
        "configuration loaded"
    );

    if config.world_size == 1 {
        return train_worker(config, Box::new(SingleProcess));
    }

    let handles = ThreadGroup::new(config.world_size)?;
    let workers: Vec<_> = handles
        .into_iter()
        .map(|handle| {
            let config = config.clone();
            let group = handle.clone();
            thread::Builder::new()
                .name(format!("worker-{}", handle.rank()))
                .spawn(move || {
                    let result = train_worker(config, Box::new(handle));
                    if let Err(e) = &result {
                        group.abort(&e.to_string());
                    }
                    result
                })
                .map_err(|e| NeuroError::Distributed(format!("spawning worker: {e}")))
        })
        .collect::<NeuroResult<_>>()?;
    for worker in workers {
        worker
            .join()
            .map_err(|_| NeuroError::Distributed("worker thread panicked".to_string()))??;
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "training failed");
            ExitCode::FAILURE
        }
    }
}
