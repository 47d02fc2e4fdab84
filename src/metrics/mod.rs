//! Per-epoch metrics record and the sinks that consume it.

use crate::checkpoint::write_json_atomic;
use crate::core::{NeuroError, NeuroResult};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Structured key-value record emitted once per epoch by rank zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    #[serde(rename = "train/loss")]
    pub train_loss: f32,
    #[serde(rename = "test/loss")]
    pub test_loss: f32,
    #[serde(rename = "train/lr")]
    pub lr: f32,
    #[serde(rename = "train/num_steps")]
    pub train_num_steps: usize,
    #[serde(rename = "test/num_steps")]
    pub test_num_steps: usize,
    #[serde(rename = "train/fwd_pct_correct")]
    pub train_fwd_pct_correct: f32,
    #[serde(rename = "train/bwd_pct_correct")]
    pub train_bwd_pct_correct: f32,
    #[serde(rename = "test/test_fwd_pct_correct")]
    pub test_fwd_pct_correct: f32,
    #[serde(rename = "test/test_bwd_pct_correct")]
    pub test_bwd_pct_correct: f32,
    #[serde(rename = "train/loss_clip_total")]
    pub train_loss_clip: f32,
    #[serde(rename = "train/loss_blurry_total")]
    pub train_loss_blurry: f32,
    #[serde(rename = "train/loss_blurry_cont_total")]
    pub train_loss_blurry_cont: f32,
    #[serde(rename = "test/loss_clip_total")]
    pub test_loss_clip: f32,
    #[serde(rename = "train/blurry_pixcorr")]
    pub train_blurry_pixcorr: f32,
    #[serde(rename = "test/blurry_pixcorr")]
    pub test_blurry_pixcorr: f32,
    #[serde(rename = "train/recon_cossim")]
    pub train_recon_cossim: f32,
    #[serde(rename = "test/recon_cossim")]
    pub test_recon_cossim: f32,
    #[serde(rename = "train/recon_mse")]
    pub train_recon_mse: f32,
    #[serde(rename = "test/recon_mse")]
    pub test_recon_mse: f32,
    #[serde(rename = "train/loss_prior")]
    pub train_loss_prior: f32,
    #[serde(rename = "test/loss_prior")]
    pub test_loss_prior: f32,
    /// Batches skipped for repeated images during the epoch preload
    #[serde(rename = "train/dropped_batches")]
    pub dropped_batches: usize,
    /// Steps skipped because a worker saw a non-finite loss
    #[serde(rename = "train/aborted_steps")]
    pub aborted_steps: usize,
}

/// Consumer of epoch reports.
pub trait MetricsSink: Send {
    fn record(&mut self, report: &EpochReport) -> NeuroResult<()>;
}

/// Collects reports in memory.
impl MetricsSink for Vec<EpochReport> {
    fn record(&mut self, report: &EpochReport) -> NeuroResult<()> {
        self.push(report.clone());
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
#[derive(Debug, Clone)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every report written so far.
    ///
    /// # Errors
    /// - `Io` if the file cannot be opened
    /// - `Format` on a malformed line
    pub fn read_all(&self) -> NeuroResult<Vec<EpochReport>> {
        let file = File::open(&self.path).map_err(|e| NeuroError::io(&self.path, e))?;
        let mut reports = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| NeuroError::io(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let report = serde_json::from_str(&line).map_err(|e| {
                NeuroError::Format(format!("{}:{}: {e}", self.path.display(), number + 1))
            })?;
            reports.push(report);
        }
        Ok(reports)
    }
}

impl MetricsSink for JsonlSink {
    fn record(&mut self, report: &EpochReport) -> NeuroResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| NeuroError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| NeuroError::io(&self.path, e))?;
        let mut line = serde_json::to_string(report)?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .map_err(|e| NeuroError::io(&self.path, e))
    }
}

/// Write the latest report as a standalone JSON file.
pub fn write_summary(path: &Path, report: &EpochReport) -> NeuroResult<()> {
    write_json_atomic(path, report)
}
