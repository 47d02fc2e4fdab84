//! Core network kernel: errors, layers, activations and named gradients.
//!
//! Every trainable piece of the model is built from [`Linear`] layers and an
//! [`Activation`]. Forward passes return the values the backward pass needs;
//! backward passes write parameter gradients into a [`Gradients`] map keyed by
//! the same dotted names the checkpoint state dict uses
//! (e.g. `ridge.linears.0.weight`).
//!
//! ## Shapes
//!
//! All activations are row-major batches: `(batch, features)`.
//! ```text
//! y = x W^T + b        W: (out, in), b: (out)
//! dW = dy^T x,  db = Σ_rows dy,  dx = dy W
//! ```

pub mod model;
pub mod prior;

use ndarray::{Array1, Array2, ArrayD, ArrayViewD, ArrayViewMutD, Axis, IxDyn};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for every fallible operation in the crate.
#[derive(Debug, Error)]
pub enum NeuroError {
    /// Shape mismatch in tensor operations or between a checkpoint and the model
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    /// Invalid configuration value
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// A required input data file does not exist
    #[error("missing data file: {}", path.display())]
    MissingData { path: PathBuf },
    /// I/O failure on a specific file
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Malformed content in an input file
    #[error("malformed data: {0}")]
    Format(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Restoration was requested but the checkpoint file is absent
    #[error("checkpoint not found: {}", path.display())]
    MissingCheckpoint { path: PathBuf },
    /// Checkpoint content cannot be mapped onto the current model
    #[error("incompatible checkpoint: {0}")]
    IncompatibleCheckpoint(String),
    /// A loss evaluated to NaN or infinity
    #[error("non-finite loss {value} at epoch {epoch}, iteration {iteration}")]
    NonFiniteLoss {
        epoch: usize,
        iteration: usize,
        value: f32,
    },
    /// Collective communication failure between workers
    #[error("distributed error: {0}")]
    Distributed(String),
    /// Subject id outside 1..=8 or not loaded
    #[error("unknown subject {0}")]
    UnknownSubject(u8),
}

pub type NeuroResult<T> = Result<T, NeuroError>;

impl NeuroError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        NeuroError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Activation function applied elementwise to a batch.
///
/// Implementations provide both the activation and its derivative so
/// backward passes can gate the incoming gradient.
pub trait Activation: Send + Sync {
    /// Apply activation to a matrix (elementwise): f(X)
    fn apply_matrix(&self, x: &Array2<f32>) -> Array2<f32>;

    /// Derivative of activation applied to matrix (elementwise): f'(X)
    fn derivative_matrix(&self, x: &Array2<f32>) -> Array2<f32>;

    /// Name for debugging
    fn name(&self) -> &'static str;
}

/// GELU with the tanh approximation.
///
/// ```text
/// f(x)  = 0.5 x (1 + tanh(k (x + c x³)))        k = sqrt(2/π), c = 0.044715
/// f'(x) = 0.5 (1 + t) + 0.5 x (1 - t²) k (1 + 3 c x²)
/// ```
#[derive(Debug, Clone, Copy)]
pub struct GeluActivation;

const GELU_K: f32 = 0.797_884_6;
const GELU_C: f32 = 0.044_715;

impl Activation for GeluActivation {
    fn apply_matrix(&self, x: &Array2<f32>) -> Array2<f32> {
        x.mapv(|v| {
            let t = (GELU_K * (v + GELU_C * v * v * v)).tanh();
            0.5 * v * (1.0 + t)
        })
    }

    fn derivative_matrix(&self, x: &Array2<f32>) -> Array2<f32> {
        x.mapv(|v| {
            let t = (GELU_K * (v + GELU_C * v * v * v)).tanh();
            0.5 * (1.0 + t) + 0.5 * v * (1.0 - t * t) * GELU_K * (1.0 + 3.0 * GELU_C * v * v)
        })
    }

    fn name(&self) -> &'static str {
        "gelu"
    }
}

/// Fully connected layer `y = x W^T + b`.
///
/// Weights and biases are initialized from U(-1/sqrt(in), 1/sqrt(in)).
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    /// Weight matrix, shape `(out_features, in_features)`
    pub weight: Array2<f32>,
    /// Bias vector, shape `(out_features)`
    pub bias: Array1<f32>,
}

/// Parameter gradients of one [`Linear`] layer.
#[derive(Debug, Clone)]
pub struct LinearGrad {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Linear {
    /// Create a layer with uniformly initialized parameters.
    ///
    /// # Errors
    /// - `InvalidConfig` if either dimension is zero
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        rng: &mut R,
    ) -> NeuroResult<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(NeuroError::InvalidConfig(format!(
                "linear layer dims must be > 0, got {in_features} -> {out_features}"
            )));
        }
        #[allow(clippy::cast_precision_loss)]
        let bound = 1.0 / (in_features as f32).sqrt();
        let dist = Uniform::new(-bound, bound);
        let weight = Array2::random_using((out_features, in_features), dist, rng);
        let bias = Array1::random_using(out_features, dist, rng);
        Ok(Self { weight, bias })
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// Forward pass on a batch `(batch, in)` → `(batch, out)`.
    ///
    /// # Errors
    /// - `ShapeMismatch` if the input width differs from `in_features`
    pub fn forward(&self, x: &Array2<f32>) -> NeuroResult<Array2<f32>> {
        if x.ncols() != self.in_features() {
            return Err(NeuroError::ShapeMismatch(format!(
                "linear input: expected {} features, got {}",
                self.in_features(),
                x.ncols()
            )));
        }
        Ok(x.dot(&self.weight.t()) + &self.bias)
    }

    /// Backward pass given the forward input and the output gradient.
    ///
    /// Returns the parameter gradients and the gradient w.r.t. the input.
    pub fn backward(&self, x: &Array2<f32>, grad_out: &Array2<f32>) -> (LinearGrad, Array2<f32>) {
        let weight = grad_out.t().dot(x);
        let bias = grad_out.sum_axis(Axis(0));
        let grad_in = grad_out.dot(&self.weight);
        (LinearGrad { weight, bias }, grad_in)
    }

    /// Append this layer's parameters to a named list.
    pub fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, ArrayViewD<'a, f32>)>) {
        out.push((format!("{prefix}.weight"), self.weight.view().into_dyn()));
        out.push((format!("{prefix}.bias"), self.bias.view().into_dyn()));
    }

    /// Visit this layer's parameters mutably.
    pub fn visit_parameters_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>),
    ) {
        f(&format!("{prefix}.weight"), self.weight.view_mut().into_dyn());
        f(&format!("{prefix}.bias"), self.bias.view_mut().into_dyn());
    }
}

impl LinearGrad {
    /// Write into a gradient map under `prefix.weight` / `prefix.bias`.
    pub fn accumulate_into(self, prefix: &str, grads: &mut Gradients) -> NeuroResult<()> {
        grads.accumulate(&format!("{prefix}.weight"), self.weight.into_dyn())?;
        grads.accumulate(&format!("{prefix}.bias"), self.bias.into_dyn())
    }
}

/// Named parameter gradients, ordered by name.
///
/// The deterministic name order is what lets data-parallel workers flatten
/// their gradients into identically laid out buffers for all-reduce.
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    map: BTreeMap<String, ArrayD<f32>>,
}

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `grad` to the entry for `name`, creating it if absent.
    ///
    /// # Errors
    /// - `ShapeMismatch` if an existing entry has a different shape; the entry is kept
    pub fn accumulate(&mut self, name: &str, grad: ArrayD<f32>) -> NeuroResult<()> {
        match self.map.get_mut(name) {
            Some(existing) if existing.shape() == grad.shape() => {
                *existing += &grad;
                Ok(())
            }
            Some(existing) => Err(NeuroError::ShapeMismatch(format!(
                "gradient for {name}: accumulated {:?}, new {:?}",
                existing.shape(),
                grad.shape()
            ))),
            None => {
                self.map.insert(name.to_string(), grad);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.map.get(name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.map.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArrayD<f32>)> {
        self.map.iter()
    }

    /// Merge another gradient map into this one.
    ///
    /// # Errors
    /// - `ShapeMismatch` from [`Gradients::accumulate`]
    pub fn extend(&mut self, other: Gradients) -> NeuroResult<()> {
        for (name, grad) in other.map {
            self.accumulate(&name, grad)?;
        }
        Ok(())
    }

    /// Ensure every `(name, shape)` has an entry, zero-filled if missing.
    pub fn fill_missing(&mut self, shapes: &[(String, Vec<usize>)]) {
        for (name, shape) in shapes {
            self.map
                .entry(name.clone())
                .or_insert_with(|| ArrayD::zeros(IxDyn(shape)));
        }
    }

    pub fn is_finite(&self) -> bool {
        self.map.values().all(|g| g.iter().all(|v| v.is_finite()))
    }

    /// Total number of scalar entries.
    pub fn numel(&self) -> usize {
        self.map.values().map(ArrayD::len).sum()
    }

    /// Concatenate all gradients in name order.
    pub fn flatten(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(self.numel());
        for grad in self.map.values() {
            flat.extend(grad.iter().copied());
        }
        flat
    }

    /// Overwrite all gradients from a buffer produced by [`Gradients::flatten`].
    ///
    /// # Errors
    /// - `ShapeMismatch` if the buffer length differs from [`Gradients::numel`]
    pub fn unflatten(&mut self, flat: &[f32]) -> NeuroResult<()> {
        if flat.len() != self.numel() {
            return Err(NeuroError::ShapeMismatch(format!(
                "gradient buffer: expected {} values, got {}",
                self.numel(),
                flat.len()
            )));
        }
        let mut offset = 0;
        for grad in self.map.values_mut() {
            for (dst, src) in grad.iter_mut().zip(&flat[offset..]) {
                *dst = *src;
            }
            offset += grad.len();
        }
        Ok(())
    }
}

/// Serializable dense tensor: shape plus row-major data.
///
/// Used for input data files (voxel matrices, image pool) and for every
/// tensor stored in a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorRecord {
    pub fn from_view(view: &ArrayViewD<'_, f32>) -> Self {
        Self {
            shape: view.shape().to_vec(),
            data: view.iter().copied().collect(),
        }
    }

    /// Rebuild the dense array.
    ///
    /// # Errors
    /// - `Format` if `data.len()` disagrees with the product of `shape`
    pub fn to_array(&self) -> NeuroResult<ArrayD<f32>> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone()).map_err(|e| {
            NeuroError::Format(format!(
                "tensor of shape {:?} with {} values: {e}",
                self.shape,
                self.data.len()
            ))
        })
    }

    /// Rebuild as a 2-D matrix.
    ///
    /// # Errors
    /// - `Format` if the record is not 2-D or its data length is wrong
    pub fn to_array2(&self) -> NeuroResult<Array2<f32>> {
        if self.shape.len() != 2 {
            return Err(NeuroError::Format(format!(
                "expected a 2-D tensor, got shape {:?}",
                self.shape
            )));
        }
        self.to_array()?
            .into_dimensionality()
            .map_err(|e| NeuroError::Format(e.to_string()))
    }
}

/// Row-wise L2 normalization, returning the normalized rows and their norms.
pub fn normalize_rows(x: &Array2<f32>) -> (Array2<f32>, Array1<f32>) {
    let norms = x.map_axis(Axis(1), |row| row.dot(&row).sqrt().max(1e-12));
    let normalized = x / &norms.view().insert_axis(Axis(1));
    (normalized, norms)
}

/// Backward pass of [`normalize_rows`].
///
/// `dx = (dy - y (y · dy)) / ||x||` per row.
pub fn normalize_rows_backward(
    normalized: &Array2<f32>,
    norms: &Array1<f32>,
    grad_out: &Array2<f32>,
) -> Array2<f32> {
    let dots = (normalized * grad_out).sum_axis(Axis(1));
    let projected = grad_out - &(normalized * &dots.view().insert_axis(Axis(1)));
    projected / &norms.view().insert_axis(Axis(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_linear_shapes() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let layer = Linear::new(5, 3, &mut rng).unwrap();
        let x = Array2::ones((4, 5));
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.dim(), (4, 3));
        assert!(layer.forward(&Array2::ones((4, 6))).is_err());
    }

    #[test]
    fn test_linear_backward_matches_finite_difference() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let layer = Linear::new(3, 2, &mut rng).unwrap();
        let x = ndarray::arr2(&[[0.5, -1.0, 2.0], [1.5, 0.25, -0.5]]);
        // loss = sum(y)
        let grad_out = Array2::ones((2, 2));
        let (grad, grad_in) = layer.backward(&x, &grad_out);

        let eps = 1e-3;
        let mut bumped = layer.clone();
        bumped.weight[[1, 2]] += eps;
        let numeric = (bumped.forward(&x).unwrap().sum() - layer.forward(&x).unwrap().sum()) / eps;
        assert_abs_diff_eq!(grad.weight[[1, 2]], numeric, epsilon = 1e-2);
        assert_abs_diff_eq!(grad.bias[0], 2.0, epsilon = 1e-6);
        assert_eq!(grad_in.dim(), (2, 3));
    }

    #[test]
    fn test_gelu_derivative() {
        let x = ndarray::arr2(&[[-2.0f32, -0.5, 0.0, 0.7, 3.0]]);
        let d = GeluActivation.derivative_matrix(&x);
        let eps = 1e-3;
        let plus = GeluActivation.apply_matrix(&(&x + eps));
        let minus = GeluActivation.apply_matrix(&(&x - eps));
        let numeric = (plus - minus) / (2.0 * eps);
        for (a, b) in d.iter().zip(numeric.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_gradients_flatten_roundtrip() {
        let mut grads = Gradients::new();
        grads.accumulate("b", ndarray::arr1(&[1.0f32, 2.0]).into_dyn()).unwrap();
        grads.accumulate("a", ndarray::arr2(&[[3.0f32], [4.0]]).into_dyn()).unwrap();
        grads.accumulate("b", ndarray::arr1(&[1.0f32, 1.0]).into_dyn()).unwrap();

        // name order: a then b
        assert_eq!(grads.flatten(), vec![3.0, 4.0, 2.0, 3.0]);
        grads.unflatten(&[0.0, 0.0, 1.0, 1.0]).unwrap();
        assert_eq!(grads.get("a").unwrap().sum(), 0.0);
        assert!(grads.unflatten(&[0.0]).is_err());
    }

    #[test]
    fn test_gradient_shape_change_is_an_error() {
        let mut grads = Gradients::new();
        grads.accumulate("w", ndarray::arr1(&[1.0f32, 2.0]).into_dyn()).unwrap();
        let result = grads.accumulate("w", ndarray::arr1(&[1.0f32, 2.0, 3.0]).into_dyn());
        assert!(matches!(result, Err(NeuroError::ShapeMismatch(_))));
        assert_eq!(grads.get("w").unwrap().as_slice().unwrap(), &[1.0, 2.0]);

        let mut other = Gradients::new();
        other.accumulate("w", ndarray::arr1(&[0.0f32]).into_dyn()).unwrap();
        assert!(grads.extend(other).is_err());
    }

    #[test]
    fn test_normalize_rows_backward_orthogonal() {
        let x = ndarray::arr2(&[[3.0f32, 4.0]]);
        let (y, norms) = normalize_rows(&x);
        assert_abs_diff_eq!(y[[0, 0]], 0.6, epsilon = 1e-6);
        // Gradient along y itself has no effect on a unit vector.
        let dx = normalize_rows_backward(&y, &norms, &y);
        assert_abs_diff_eq!(dx[[0, 0]], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(dx[[0, 1]], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_tensor_record_validates_length() {
        let record = TensorRecord {
            shape: vec![2, 2],
            data: vec![1.0, 2.0, 3.0],
        };
        assert!(record.to_array2().is_err());
    }
}
