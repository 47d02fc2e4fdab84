//! Checkpoint Manager: rank-gated atomic save and flag-controlled restore.
//!
//! One JSON file per tag under `<output_dir>/<model_name>/<tag>.json` holding
//! the model state dict, optimizer and scheduler state, the next epoch to
//! run and the loss/learning-rate histories. Files are written to a temporary
//! sibling and renamed into place, so a reader never sees a partial file.

use crate::core::model::{BrainModel, LoadReport};
use crate::core::{NeuroError, NeuroResult, TensorRecord};
use crate::distributed::Collective;
use crate::optim::{LrScheduler, OptimizerState};
use crate::training::TrainingState;
use crate::TrainConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Projection weight dropped when moving a multi-subject checkpoint into a
/// single-subject run: its input width belongs to another subject.
pub const MULTISUBJECT_DROP_KEY: &str = "ridge.linears.0.weight";

/// Tag of the newest checkpoint.
pub const LAST_TAG: &str = "last";

/// Full persisted training state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Next epoch to run
    pub epoch: usize,
    pub model_state_dict: BTreeMap<String, TensorRecord>,
    pub optimizer_state_dict: OptimizerState,
    pub lr_scheduler: LrScheduler,
    pub train_losses: Vec<f32>,
    pub test_losses: Vec<f32>,
    pub lrs: Vec<f32>,
    pub best_test_loss: Option<f32>,
}

impl Checkpoint {
    pub fn capture(model: &BrainModel, state: &TrainingState) -> Self {
        Self {
            epoch: state.epoch,
            model_state_dict: model.state_dict(),
            optimizer_state_dict: state.optimizer.state(),
            lr_scheduler: state.scheduler.clone(),
            train_losses: state.train_losses.clone(),
            test_losses: state.test_losses.clone(),
            lrs: state.lrs.clone(),
            best_test_loss: state.best_test_loss,
        }
    }
}

/// Which parts of a checkpoint to restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub load_optimizer: bool,
    pub load_scheduler: bool,
    /// Restore the epoch counter and loss histories
    pub load_epoch: bool,
    /// Fail on missing or unexpected parameter names
    pub strict: bool,
    /// Drop [`MULTISUBJECT_DROP_KEY`] before loading
    pub multisubject_compat: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            load_optimizer: true,
            load_scheduler: true,
            load_epoch: true,
            strict: true,
            multisubject_compat: false,
        }
    }
}

impl LoadOptions {
    /// Weights-only transfer from a multi-subject pretraining run.
    pub fn multisubject_transfer() -> Self {
        Self {
            load_optimizer: false,
            load_scheduler: false,
            load_epoch: false,
            strict: false,
            multisubject_compat: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(output_dir: &Path, model_name: &str) -> Self {
        Self {
            dir: output_dir.join(model_name),
        }
    }

    /// Manager reading from an existing run directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("{tag}.json"))
    }

    pub fn exists(&self, tag: &str) -> bool {
        self.path(tag).exists()
    }

    /// Write a checkpoint if this worker is the main process.
    ///
    /// Returns the written path on the main process and `None` elsewhere.
    ///
    /// # Errors
    /// - `Io` / `Json` on write failure
    pub fn save(
        &self,
        tag: &str,
        model: &BrainModel,
        state: &TrainingState,
        collective: &dyn Collective,
    ) -> NeuroResult<Option<PathBuf>> {
        if !collective.is_main_process() {
            return Ok(None);
        }
        let path = self.path(tag);
        write_json_atomic(&path, &Checkpoint::capture(model, state))?;
        info!(tag, path = %path.display(), epoch = state.epoch, "saved checkpoint");
        Ok(Some(path))
    }

    /// Read a checkpoint file.
    ///
    /// # Errors
    /// - `MissingCheckpoint` if no file exists for `tag`
    /// - `Io` / `Format` on read or parse failure
    pub fn read(&self, tag: &str) -> NeuroResult<Checkpoint> {
        let path = self.path(tag);
        if !path.exists() {
            return Err(NeuroError::MissingCheckpoint { path });
        }
        let file = File::open(&path).map_err(|e| NeuroError::io(&path, e))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| NeuroError::Format(format!("{}: {e}", path.display())))
    }

    /// Restore a checkpoint into the model and training state.
    ///
    /// Model weights are always restored; the rest follows `options`. On any
    /// error both the model and `state` are left unchanged.
    ///
    /// # Errors
    /// - `MissingCheckpoint` if the file is absent
    /// - `IncompatibleCheckpoint` on shape mismatch, or key mismatch when strict
    pub fn load(
        &self,
        tag: &str,
        options: LoadOptions,
        model: &mut BrainModel,
        state: &mut TrainingState,
    ) -> NeuroResult<LoadReport> {
        let mut checkpoint = self.read(tag)?;
        if options.multisubject_compat
            && checkpoint
                .model_state_dict
                .remove(MULTISUBJECT_DROP_KEY)
                .is_some()
        {
            info!(key = MULTISUBJECT_DROP_KEY, "dropped per-subject projection weight");
        }
        let optimizer = if options.load_optimizer {
            let mut restored = state.optimizer.clone();
            restored.load_state(&checkpoint.optimizer_state_dict)?;
            Some(restored)
        } else {
            None
        };

        let report = model.load_state_dict(&checkpoint.model_state_dict, options.strict)?;
        if !report.missing.is_empty() || !report.unexpected.is_empty() {
            warn!(
                missing = ?report.missing,
                unexpected = ?report.unexpected,
                "non-strict checkpoint load"
            );
        }

        if let Some(optimizer) = optimizer {
            state.optimizer = optimizer;
        }
        if options.load_scheduler {
            state.scheduler = checkpoint.lr_scheduler;
        }
        if options.load_epoch {
            state.epoch = checkpoint.epoch;
            state.train_losses = checkpoint.train_losses;
            state.test_losses = checkpoint.test_losses;
            state.lrs = checkpoint.lrs;
            state.best_test_loss = checkpoint.best_test_loss;
        }
        info!(tag, dir = %self.dir.display(), epoch = state.epoch, "loaded checkpoint");
        Ok(report)
    }

    /// Write the resolved configuration next to the checkpoints (main process only).
    pub fn save_config(&self, config: &TrainConfig, collective: &dyn Collective) -> NeuroResult<()> {
        if collective.is_main_process() {
            write_json_atomic(&self.dir.join("config.json"), config)?;
        }
        Ok(())
    }
}

/// Serialize to a temporary sibling file, then rename over `path`.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> NeuroResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| NeuroError::io(parent, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let file = File::create(&tmp).map_err(|e| NeuroError::io(&tmp, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, value)?;
        writer.flush().map_err(|e| NeuroError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| NeuroError::io(path, e))
}
