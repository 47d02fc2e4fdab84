//! Subject data: voxel stores, trial records, the image pool and trial streams.
//!
//! Everything here is loaded once at startup and read-only afterwards. A
//! missing or malformed file fails the load immediately with an error naming
//! the file, so no training iteration ever starts on partial data.
//!
//! ## Layout under the data root
//!
//! ```text
//! images.json              TensorRecord [N, C, H, W]
//! betas_subj0{s}.json      TensorRecord [trials, voxels]
//! subj0{s}/train.jsonl     one Trial per line
//! subj0{s}/test.jsonl      old held-out split
//! subj0{s}/new_test.jsonl  new held-out split
//! ```

pub mod assembler;

pub use assembler::{BatchAssembler, CorruptionDescriptors, EpochBatches, SubjectPart, TrainingBatch};

use crate::core::{NeuroError, NeuroResult, TensorRecord};
use ndarray::{Array2, Array4, Axis, Ix4};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One stimulus presentation: which image was shown and which voxel row recorded it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trial {
    pub image_index: usize,
    pub voxel_index: usize,
    /// Scanning session the trial belongs to
    #[serde(default)]
    pub session: usize,
    /// Presentation number of this image for the subject
    #[serde(default)]
    pub repeat: usize,
}

/// Read a JSON document, mapping a missing file to `MissingData`.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> NeuroResult<T> {
    let file = open(path)?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| NeuroError::Format(format!("{}: {e}", path.display())))
}

fn open(path: &Path) -> NeuroResult<File> {
    if !path.exists() {
        return Err(NeuroError::MissingData {
            path: path.to_path_buf(),
        });
    }
    File::open(path).map_err(|e| NeuroError::io(path, e))
}

/// Read a JSON Lines trial file. Blank lines are skipped.
///
/// # Errors
/// - `MissingData` if the file does not exist
/// - `Format` on a malformed line (reported with its line number)
pub fn read_trials(path: &Path) -> NeuroResult<Vec<Trial>> {
    let reader = BufReader::new(open(path)?);
    let mut trials = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| NeuroError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let trial: Trial = serde_json::from_str(&line).map_err(|e| {
            NeuroError::Format(format!("{}:{}: {e}", path.display(), lineno + 1))
        })?;
        trials.push(trial);
    }
    Ok(trials)
}

// ============================================================================
// Voxel Store
// ============================================================================

/// Dense per-subject table: voxel row index → voxel vector.
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelStore {
    voxels: Array2<f32>,
}

impl VoxelStore {
    pub fn new(voxels: Array2<f32>) -> Self {
        Self { voxels }
    }

    /// # Errors
    /// - `MissingData` / `Format` if the file is absent or not a 2-D tensor
    pub fn load(path: &Path) -> NeuroResult<Self> {
        let record: TensorRecord = read_json(path)?;
        let voxels = record
            .to_array2()
            .map_err(|e| NeuroError::Format(format!("{}: {e}", path.display())))?;
        Ok(Self { voxels })
    }

    pub fn num_trials(&self) -> usize {
        self.voxels.nrows()
    }

    pub fn num_voxels(&self) -> usize {
        self.voxels.ncols()
    }

    /// Gather voxel rows in the given order.
    ///
    /// # Errors
    /// - `ShapeMismatch` if any index is out of range
    pub fn rows(&self, indices: &[usize]) -> NeuroResult<Array2<f32>> {
        if let Some(bad) = indices.iter().find(|&&i| i >= self.num_trials()) {
            return Err(NeuroError::ShapeMismatch(format!(
                "voxel row {bad} out of range ({} rows)",
                self.num_trials()
            )));
        }
        Ok(self.voxels.select(Axis(0), indices))
    }
}

// ============================================================================
// Image pool
// ============================================================================

/// Random-access pool of stimulus images addressed by global image index.
pub trait ImageStore: Send + Sync {
    /// Number of images in the pool
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(channels, height, width)` of every image
    fn image_shape(&self) -> (usize, usize, usize);

    /// Read images for strictly increasing, unique indices.
    fn read_sorted(&self, indices: &[usize]) -> NeuroResult<Array4<f32>>;
}

/// Image pool held fully in memory.
#[derive(Debug, Clone)]
pub struct InMemoryImages {
    images: Array4<f32>,
}

impl InMemoryImages {
    pub fn new(images: Array4<f32>) -> Self {
        Self { images }
    }

    /// # Errors
    /// - `MissingData` / `Format` if the file is absent or not `[N, C, H, W]`
    pub fn load(path: &Path) -> NeuroResult<Self> {
        let record: TensorRecord = read_json(path)?;
        if record.shape.len() != 4 {
            return Err(NeuroError::Format(format!(
                "{}: expected [N, C, H, W], got {:?}",
                path.display(),
                record.shape
            )));
        }
        let images = record
            .to_array()?
            .into_dimensionality::<Ix4>()
            .map_err(|e| NeuroError::Format(format!("{}: {e}", path.display())))?;
        Ok(Self { images })
    }
}

impl ImageStore for InMemoryImages {
    fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    fn image_shape(&self) -> (usize, usize, usize) {
        let (_, c, h, w) = self.images.dim();
        (c, h, w)
    }

    fn read_sorted(&self, indices: &[usize]) -> NeuroResult<Array4<f32>> {
        if let Some(bad) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(NeuroError::ShapeMismatch(format!(
                "image {bad} out of range ({} images)",
                self.len()
            )));
        }
        Ok(self.images.select(Axis(0), indices))
    }
}

/// Resolve images in arbitrary order through the sorted unique index set.
///
/// The store is read once per distinct image in increasing index order; the
/// result is scattered back so row `i` holds image `indices[i]`.
pub fn fetch_images(store: &dyn ImageStore, indices: &[usize]) -> NeuroResult<Array4<f32>> {
    let unique: Vec<usize> = indices.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
    let sorted = store.read_sorted(&unique)?;
    let positions: Vec<usize> = indices
        .iter()
        .map(|i| unique.binary_search(i).unwrap_or_default())
        .collect();
    Ok(sorted.select(Axis(0), &positions))
}

// ============================================================================
// Subjects
// ============================================================================

/// Which held-out split to evaluate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestSplit {
    Old,
    New,
}

impl TestSplit {
    fn file_name(self) -> &'static str {
        match self {
            TestSplit::Old => "test.jsonl",
            TestSplit::New => "new_test.jsonl",
        }
    }
}

/// What to load for one subject.
#[derive(Debug, Clone, Copy)]
pub struct SubjectRequest {
    pub id: u8,
    /// Training trials from sessions at or beyond this count are excluded
    pub num_sessions: usize,
}

/// A subject's voxel store and trial lists.
#[derive(Debug, Clone)]
pub struct Subject {
    pub id: u8,
    pub voxels: VoxelStore,
    pub train: Vec<Trial>,
    pub test: Vec<Trial>,
}

pub fn voxel_path(data_path: &Path, id: u8) -> PathBuf {
    data_path.join(format!("betas_subj0{id}.json"))
}

pub fn trial_dir(data_path: &Path, id: u8) -> PathBuf {
    data_path.join(format!("subj0{id}"))
}

impl Subject {
    /// Load and validate one subject.
    ///
    /// # Errors
    /// - `MissingData` / `Format` for absent or malformed files
    /// - `Format` if a trial references an image or voxel row that does not exist
    pub fn load(
        data_path: &Path,
        request: SubjectRequest,
        split: TestSplit,
        num_images: usize,
    ) -> NeuroResult<Self> {
        let voxels = VoxelStore::load(&voxel_path(data_path, request.id))?;
        let dir = trial_dir(data_path, request.id);

        let train_path = dir.join("train.jsonl");
        let train: Vec<Trial> = read_trials(&train_path)?
            .into_iter()
            .filter(|t| t.session < request.num_sessions)
            .collect();
        validate_trials(&train_path, &train, &voxels, num_images)?;

        let test_path = dir.join(split.file_name());
        let test = read_trials(&test_path)?;
        validate_trials(&test_path, &test, &voxels, num_images)?;

        debug!(
            subject = request.id,
            train = train.len(),
            test = test.len(),
            voxels = voxels.num_voxels(),
            "loaded subject"
        );
        Ok(Self {
            id: request.id,
            voxels,
            train,
            test,
        })
    }
}

fn validate_trials(
    path: &Path,
    trials: &[Trial],
    voxels: &VoxelStore,
    num_images: usize,
) -> NeuroResult<()> {
    for trial in trials {
        if trial.image_index >= num_images {
            return Err(NeuroError::Format(format!(
                "{}: image index {} out of range ({num_images} images)",
                path.display(),
                trial.image_index
            )));
        }
        if trial.voxel_index >= voxels.num_trials() {
            return Err(NeuroError::Format(format!(
                "{}: voxel index {} out of range ({} rows)",
                path.display(),
                trial.voxel_index,
                voxels.num_trials()
            )));
        }
    }
    Ok(())
}

/// Load several subjects in parallel, failing on the first error.
pub fn load_subjects(
    data_path: &Path,
    requests: &[SubjectRequest],
    split: TestSplit,
    num_images: usize,
) -> NeuroResult<Vec<Subject>> {
    let subjects = requests
        .par_iter()
        .map(|r| Subject::load(data_path, *r, split, num_images))
        .collect::<NeuroResult<Vec<_>>>()?;
    info!(
        subjects = ?subjects.iter().map(|s| s.id).collect::<Vec<_>>(),
        "subject data loaded"
    );
    Ok(subjects)
}

// ============================================================================
// Paired-Sample Loader
// ============================================================================

/// Shuffled stream of fixed-size trial batches for one subject.
///
/// A resampling stream reshuffles whenever it runs out and never ends; a
/// single-pass stream ends after one shuffled pass. Incomplete trailing
/// batches are discarded.
#[derive(Debug, Clone)]
pub struct TrialStream {
    trials: Vec<Trial>,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    resample: bool,
    rng: ChaCha8Rng,
}

impl TrialStream {
    pub fn new(trials: Vec<Trial>, batch_size: usize, resample: bool, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..trials.len()).collect();
        order.shuffle(&mut rng);
        Self {
            trials,
            order,
            cursor: 0,
            batch_size,
            resample,
            rng,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_trials(&self) -> usize {
        self.trials.len()
    }

    /// Next batch of trials, or `None` once a single-pass stream is exhausted.
    ///
    /// A stream with fewer trials than one batch is always exhausted.
    pub fn next_batch(&mut self) -> Option<Vec<Trial>> {
        if self.batch_size == 0 || self.trials.len() < self.batch_size {
            return None;
        }
        if self.cursor + self.batch_size > self.order.len() {
            if !self.resample {
                return None;
            }
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let batch = self.order[self.cursor..self.cursor + self.batch_size]
            .iter()
            .map(|&i| self.trials[i])
            .collect();
        self.cursor += self.batch_size;
        Some(batch)
    }
}

/// True if no image index repeats within the batch.
pub fn has_unique_images(trials: &[Trial]) -> bool {
    let unique: BTreeSet<usize> = trials.iter().map(|t| t.image_index).collect();
    unique.len() == trials.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use std::io::Write;

    fn trial(image_index: usize, voxel_index: usize) -> Trial {
        Trial {
            image_index,
            voxel_index,
            session: 0,
            repeat: 0,
        }
    }

    #[test]
    fn test_fetch_images_scatters_back_to_request_order() {
        let images = Array::from_shape_fn((4, 1, 1, 1), |(n, _, _, _)| n as f32);
        let store = InMemoryImages::new(images);
        let out = fetch_images(&store, &[3, 0, 3, 1]).expect("fetch");
        let got: Vec<f32> = out.iter().copied().collect();
        assert_eq!(got, vec![3.0, 0.0, 3.0, 1.0]);
    }

    #[test]
    fn test_fetch_images_rejects_out_of_range() {
        let store = InMemoryImages::new(Array4::zeros((2, 1, 1, 1)));
        assert!(fetch_images(&store, &[0, 5]).is_err());
    }

    #[test]
    fn test_single_pass_stream_ends() {
        let trials: Vec<Trial> = (0..5).map(|i| trial(i, i)).collect();
        let mut stream = TrialStream::new(trials, 2, false, 0);
        assert!(stream.next_batch().is_some());
        assert!(stream.next_batch().is_some());
        assert!(stream.next_batch().is_none(), "trailing partial batch dropped");
    }

    #[test]
    fn test_resampling_stream_is_endless_and_seeded() {
        let trials: Vec<Trial> = (0..3).map(|i| trial(i, i)).collect();
        let mut a = TrialStream::new(trials.clone(), 2, true, 9);
        let mut b = TrialStream::new(trials, 2, true, 9);
        for _ in 0..10 {
            let batch_a = a.next_batch().expect("endless stream");
            assert_eq!(Some(batch_a), b.next_batch());
        }
    }

    #[test]
    fn test_stream_smaller_than_batch_is_empty() {
        let mut stream = TrialStream::new(vec![trial(0, 0)], 2, true, 0);
        assert!(stream.next_batch().is_none());
    }

    #[test]
    fn test_has_unique_images() {
        assert!(has_unique_images(&[trial(0, 0), trial(1, 1)]));
        assert!(!has_unique_images(&[trial(0, 0), trial(0, 1)]));
    }

    #[test]
    fn test_read_trials_reports_line_number() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("train.jsonl");
        let mut f = File::create(&path).expect("create");
        writeln!(f, r#"{{"image_index": 0, "voxel_index": 1}}"#).expect("write");
        writeln!(f).expect("write");
        writeln!(f, "not json").expect("write");
        let err = read_trials(&path).expect_err("malformed line");
        assert!(err.to_string().contains(":3:"), "got {err}");
    }

    #[test]
    fn test_missing_voxel_file_fails_fast() {
        let dir = tempfile::tempdir().expect("tempdir");
        let request = SubjectRequest {
            id: 1,
            num_sessions: 40,
        };
        let err = Subject::load(dir.path(), request, TestSplit::New, 10).expect_err("missing");
        assert!(matches!(err, NeuroError::MissingData { .. }));
    }

    #[test]
    fn test_voxel_rows_out_of_range() {
        let store = VoxelStore::new(Array2::zeros((2, 3)));
        assert_eq!(store.rows(&[1, 0]).expect("rows").dim(), (2, 3));
        assert!(store.rows(&[2]).is_err());
    }
}
