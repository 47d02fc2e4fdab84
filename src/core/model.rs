//! Subject projection, shared backbone and the assembled brain model.
//!
//! ## Data flow
//!
//! ```text
//! voxels[s] (b_s, v_s) ──ridge.linears[s]──▶ (b_s, hidden) ─┐
//!                                                            ├─ concat ─▶ h0 (B, hidden)
//! voxels[t] (b_t, v_t) ──ridge.linears[t]──▶ (b_t, hidden) ─┘
//!
//! h_{k+1} = h_k + gelu(mlp_k(h_k))                      k = 0..n_blocks
//! conditioning = backbone_linear(h_n)                   (B, clip_dim)
//! clip         = clip_proj(gelu(conditioning))          (B, clip_dim)
//! blur latent  = blur_latent(h_n)                       (B, latent_dim)   [optional]
//! blur feats   = blur_features(h_n)                     (B, perceptual_dim) [optional]
//! ```
//!
//! Each subject owns its own projection layer; no weights are shared across
//! subjects. The backbone has no internal randomness, so forward passes are
//! deterministic for fixed weights and input.

use super::prior::DiffusionPrior;
use super::{
    Activation, GeluActivation, Gradients, Linear, NeuroError, NeuroResult, TensorRecord,
};
use ndarray::{s, Array2, ArrayViewD, ArrayViewMutD, Axis};
use rand::Rng;
use std::collections::BTreeMap;

/// Shape contract of the model, derived once from the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    /// Native voxel count per subject slot, in subject-list order
    pub num_voxels: Vec<usize>,
    /// Shared latent width produced by the projection layer
    pub hidden_dim: usize,
    /// Number of residual blocks in the backbone
    pub n_blocks: usize,
    /// Width of the target vision-encoder embedding
    pub clip_dim: usize,
    /// Width of the compressed image latent; `Some` enables the reconstruction head
    pub latent_dim: Option<usize>,
    /// Width of the perceptual embedding matched by the auxiliary features
    pub perceptual_dim: usize,
    /// Whether the diffusion prior is part of the model
    pub use_prior: bool,
}

/// Per-subject affine projection into the shared latent space.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectProjection {
    pub linears: Vec<Linear>,
}

impl SubjectProjection {
    pub fn new<R: Rng + ?Sized>(
        num_voxels: &[usize],
        hidden_dim: usize,
        rng: &mut R,
    ) -> NeuroResult<Self> {
        if num_voxels.is_empty() {
            return Err(NeuroError::InvalidConfig(
                "projection needs at least one subject".to_string(),
            ));
        }
        let linears = num_voxels
            .iter()
            .map(|&v| Linear::new(v, hidden_dim, rng))
            .collect::<NeuroResult<Vec<_>>>()?;
        Ok(Self { linears })
    }

    pub fn num_subjects(&self) -> usize {
        self.linears.len()
    }

    /// Project a batch of one subject's voxel vectors.
    ///
    /// # Errors
    /// - `InvalidConfig` if `slot` has no projection
    /// - `ShapeMismatch` if the voxel width is not that subject's
    pub fn project(&self, voxels: &Array2<f32>, slot: usize) -> NeuroResult<Array2<f32>> {
        self.layer(slot)?.forward(voxels)
    }

    fn layer(&self, slot: usize) -> NeuroResult<&Linear> {
        self.linears.get(slot).ok_or_else(|| {
            NeuroError::InvalidConfig(format!(
                "no projection for subject slot {slot} ({} loaded)",
                self.linears.len()
            ))
        })
    }
}

/// Outputs of the shared backbone.
#[derive(Debug, Clone)]
pub struct BackboneOutput {
    /// Conditioning representation consumed by the diffusion prior
    pub conditioning: Array2<f32>,
    /// Contrastive embedding matched against the vision-encoder embedding
    pub clip: Array2<f32>,
    /// Reconstruction head outputs, present when reconstruction is enabled
    pub blur: Option<BlurOutput>,
}

#[derive(Debug, Clone)]
pub struct BlurOutput {
    /// Predicted compressed-image latent
    pub latent: Array2<f32>,
    /// Auxiliary features matched against perceptual embeddings
    pub features: Array2<f32>,
}

/// Gradients of a scalar loss with respect to each backbone output.
#[derive(Debug, Clone)]
pub struct OutputGrads {
    pub conditioning: Array2<f32>,
    pub clip: Array2<f32>,
    pub blur_latent: Option<Array2<f32>>,
    pub blur_features: Option<Array2<f32>>,
}

impl OutputGrads {
    /// Zero gradients shaped like `output`.
    pub fn zeros_like(output: &BackboneOutput) -> Self {
        Self {
            conditioning: Array2::zeros(output.conditioning.dim()),
            clip: Array2::zeros(output.clip.dim()),
            blur_latent: output.blur.as_ref().map(|b| Array2::zeros(b.latent.dim())),
            blur_features: output.blur.as_ref().map(|b| Array2::zeros(b.features.dim())),
        }
    }
}

/// Values saved by the backbone forward pass for its backward pass.
#[derive(Debug, Clone)]
pub struct BackboneCache {
    hidden: Vec<Array2<f32>>,
    pre: Vec<Array2<f32>>,
    conditioning: Array2<f32>,
    clip_in: Array2<f32>,
}

/// Residual MLP backbone with contrastive, conditioning and reconstruction heads.
#[derive(Debug, Clone, PartialEq)]
pub struct Backbone {
    pub mlp: Vec<Linear>,
    pub backbone_linear: Linear,
    pub clip_proj: Linear,
    pub blur_latent: Option<Linear>,
    pub blur_features: Option<Linear>,
}

impl Backbone {
    pub fn new<R: Rng + ?Sized>(spec: &ModelSpec, rng: &mut R) -> NeuroResult<Self> {
        let mlp = (0..spec.n_blocks)
            .map(|_| Linear::new(spec.hidden_dim, spec.hidden_dim, rng))
            .collect::<NeuroResult<Vec<_>>>()?;
        let backbone_linear = Linear::new(spec.hidden_dim, spec.clip_dim, rng)?;
        let clip_proj = Linear::new(spec.clip_dim, spec.clip_dim, rng)?;
        let (blur_latent, blur_features) = match spec.latent_dim {
            Some(latent_dim) => (
                Some(Linear::new(spec.hidden_dim, latent_dim, rng)?),
                Some(Linear::new(spec.hidden_dim, spec.perceptual_dim, rng)?),
            ),
            None => (None, None),
        };
        Ok(Self {
            mlp,
            backbone_linear,
            clip_proj,
            blur_latent,
            blur_features,
        })
    }

    /// Forward pass from shared-space vectors `(B, hidden)`.
    pub fn forward(&self, h0: Array2<f32>) -> NeuroResult<(BackboneOutput, BackboneCache)> {
        let gelu = GeluActivation;
        let mut hidden = Vec::with_capacity(self.mlp.len() + 1);
        let mut pre = Vec::with_capacity(self.mlp.len());
        hidden.push(h0);

        for layer in &self.mlp {
            let h = &hidden[hidden.len() - 1];
            let z = layer.forward(h)?;
            let next = h + &gelu.apply_matrix(&z);
            pre.push(z);
            hidden.push(next);
        }

        let h_n = &hidden[hidden.len() - 1];
        let conditioning = self.backbone_linear.forward(h_n)?;
        let clip_in = gelu.apply_matrix(&conditioning);
        let clip = self.clip_proj.forward(&clip_in)?;

        let blur = match (&self.blur_latent, &self.blur_features) {
            (Some(latent_head), Some(feature_head)) => Some(BlurOutput {
                latent: latent_head.forward(h_n)?,
                features: feature_head.forward(h_n)?,
            }),
            _ => None,
        };

        let output = BackboneOutput {
            conditioning: conditioning.clone(),
            clip,
            blur,
        };
        let cache = BackboneCache {
            hidden,
            pre,
            conditioning,
            clip_in,
        };
        Ok((output, cache))
    }

    /// Backward pass; returns gradients w.r.t. the backbone input.
    pub fn backward(
        &self,
        cache: &BackboneCache,
        grads: &OutputGrads,
        param_grads: &mut Gradients,
    ) -> NeuroResult<Array2<f32>> {
        let gelu = GeluActivation;
        let h_n = &cache.hidden[cache.hidden.len() - 1];

        let (g_clip, d_clip_in) = self.clip_proj.backward(&cache.clip_in, &grads.clip);
        g_clip.accumulate_into("backbone.clip_proj", param_grads)?;
        let d_cond = &grads.conditioning + &(d_clip_in * gelu.derivative_matrix(&cache.conditioning));

        let (g_bl, mut d_h) = self.backbone_linear.backward(h_n, &d_cond);
        g_bl.accumulate_into("backbone.backbone_linear", param_grads)?;

        if let (Some(head), Some(d_latent)) = (&self.blur_latent, &grads.blur_latent) {
            let (g, d) = head.backward(h_n, d_latent);
            g.accumulate_into("backbone.blur_latent", param_grads)?;
            d_h += &d;
        }
        if let (Some(head), Some(d_features)) = (&self.blur_features, &grads.blur_features) {
            let (g, d) = head.backward(h_n, d_features);
            g.accumulate_into("backbone.blur_features", param_grads)?;
            d_h += &d;
        }

        for (k, layer) in self.mlp.iter().enumerate().rev() {
            let d_pre = &d_h * &gelu.derivative_matrix(&cache.pre[k]);
            let (g, d_from_block) = layer.backward(&cache.hidden[k], &d_pre);
            g.accumulate_into(&format!("backbone.mlp.{k}"), param_grads)?;
            d_h += &d_from_block;
        }
        Ok(d_h)
    }

    fn named_parameters<'a>(&'a self, out: &mut Vec<(String, ArrayViewD<'a, f32>)>) {
        for (k, layer) in self.mlp.iter().enumerate() {
            layer.named_parameters(&format!("backbone.mlp.{k}"), out);
        }
        self.backbone_linear
            .named_parameters("backbone.backbone_linear", out);
        self.clip_proj.named_parameters("backbone.clip_proj", out);
        if let Some(head) = &self.blur_latent {
            head.named_parameters("backbone.blur_latent", out);
        }
        if let Some(head) = &self.blur_features {
            head.named_parameters("backbone.blur_features", out);
        }
    }

    fn visit_parameters_mut(&mut self, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        for (k, layer) in self.mlp.iter_mut().enumerate() {
            layer.visit_parameters_mut(&format!("backbone.mlp.{k}"), f);
        }
        self.backbone_linear
            .visit_parameters_mut("backbone.backbone_linear", f);
        self.clip_proj.visit_parameters_mut("backbone.clip_proj", f);
        if let Some(head) = &mut self.blur_latent {
            head.visit_parameters_mut("backbone.blur_latent", f);
        }
        if let Some(head) = &mut self.blur_features {
            head.visit_parameters_mut("backbone.blur_features", f);
        }
    }
}

/// One subject's slice of a combined batch.
#[derive(Debug, Clone, Copy)]
pub struct SubjectSlice<'a> {
    /// Position of the subject in the subject list (selects its projection)
    pub slot: usize,
    pub voxels: &'a Array2<f32>,
}

/// Values saved by [`BrainModel::forward`] for [`BrainModel::backward`].
#[derive(Debug, Clone)]
pub struct ForwardCache {
    inputs: Vec<(usize, Array2<f32>)>,
    backbone: BackboneCache,
}

/// Outcome of loading a state dict.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Model parameters absent from the state dict (left at current values)
    pub missing: Vec<String>,
    /// State-dict entries with no matching model parameter
    pub unexpected: Vec<String>,
}

/// Projection layer + backbone + optional diffusion prior.
#[derive(Debug, Clone, PartialEq)]
pub struct BrainModel {
    pub ridge: SubjectProjection,
    pub backbone: Backbone,
    pub diffusion_prior: Option<DiffusionPrior>,
}

impl BrainModel {
    pub fn new<R: Rng + ?Sized>(spec: &ModelSpec, rng: &mut R) -> NeuroResult<Self> {
        let ridge = SubjectProjection::new(&spec.num_voxels, spec.hidden_dim, rng)?;
        let backbone = Backbone::new(spec, rng)?;
        let diffusion_prior = if spec.use_prior {
            Some(DiffusionPrior::new(spec.clip_dim, rng)?)
        } else {
            None
        };
        Ok(Self {
            ridge,
            backbone,
            diffusion_prior,
        })
    }

    /// Forward pass over subject slices concatenated along the batch axis.
    ///
    /// # Errors
    /// - `ShapeMismatch` / `UnknownSubject` from the projection layer
    pub fn forward(
        &self,
        slices: &[SubjectSlice<'_>],
    ) -> NeuroResult<(BackboneOutput, ForwardCache)> {
        if slices.is_empty() {
            return Err(NeuroError::ShapeMismatch(
                "forward pass needs at least one subject slice".to_string(),
            ));
        }
        let projected = slices
            .iter()
            .map(|s| self.ridge.project(s.voxels, s.slot))
            .collect::<NeuroResult<Vec<_>>>()?;
        let views: Vec<_> = projected.iter().map(Array2::view).collect();
        let h0 = ndarray::concatenate(Axis(0), &views)
            .map_err(|e| NeuroError::ShapeMismatch(e.to_string()))?;

        let (output, backbone) = self.backbone.forward(h0)?;
        let inputs = slices
            .iter()
            .map(|s| (s.slot, s.voxels.clone()))
            .collect();
        Ok((output, ForwardCache { inputs, backbone }))
    }

    /// Forward pass for a single subject (evaluation and probing).
    pub fn forward_subject(
        &self,
        voxels: &Array2<f32>,
        slot: usize,
    ) -> NeuroResult<BackboneOutput> {
        let h0 = self.ridge.project(voxels, slot)?;
        Ok(self.backbone.forward(h0)?.0)
    }

    /// Backward pass through backbone and projections.
    pub fn backward(&self, cache: &ForwardCache, grads: &OutputGrads) -> NeuroResult<Gradients> {
        let mut param_grads = Gradients::new();
        let d_h0 = self.backbone.backward(&cache.backbone, grads, &mut param_grads)?;

        let mut start = 0;
        for (slot, voxels) in &cache.inputs {
            let rows = voxels.nrows();
            let d_slice = d_h0.slice(s![start..start + rows, ..]).to_owned();
            let layer = self.ridge.layer(*slot)?;
            let (g, _) = layer.backward(voxels, &d_slice);
            g.accumulate_into(&format!("ridge.linears.{slot}"), &mut param_grads)?;
            start += rows;
        }
        Ok(param_grads)
    }

    /// All parameters with their dotted names.
    pub fn named_parameters(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        let mut out = Vec::new();
        for (slot, layer) in self.ridge.linears.iter().enumerate() {
            layer.named_parameters(&format!("ridge.linears.{slot}"), &mut out);
        }
        self.backbone.named_parameters(&mut out);
        if let Some(prior) = &self.diffusion_prior {
            prior.named_parameters(&mut out);
        }
        out
    }

    /// Visit every parameter mutably, in the same order as `named_parameters`.
    pub fn visit_parameters_mut(&mut self, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        for (slot, layer) in self.ridge.linears.iter_mut().enumerate() {
            layer.visit_parameters_mut(&format!("ridge.linears.{slot}"), f);
        }
        self.backbone.visit_parameters_mut(f);
        if let Some(prior) = &mut self.diffusion_prior {
            prior.visit_parameters_mut(f);
        }
    }

    /// `(name, shape)` of every parameter.
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        self.named_parameters()
            .into_iter()
            .map(|(name, view)| (name, view.shape().to_vec()))
            .collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.named_parameters().iter().map(|(_, v)| v.len()).sum()
    }

    /// Snapshot of all parameters as serializable records.
    pub fn state_dict(&self) -> BTreeMap<String, TensorRecord> {
        self.named_parameters()
            .into_iter()
            .map(|(name, view)| (name, TensorRecord::from_view(&view)))
            .collect()
    }

    /// Copy parameters from a state dict.
    ///
    /// Shape disagreements always fail and leave the model untouched. With
    /// `strict`, missing or unexpected names also fail.
    ///
    /// # Errors
    /// - `IncompatibleCheckpoint` on shape mismatch, or on key mismatch when strict
    pub fn load_state_dict(
        &mut self,
        state: &BTreeMap<String, TensorRecord>,
        strict: bool,
    ) -> NeuroResult<LoadReport> {
        let shapes = self.parameter_shapes();
        let mut report = LoadReport::default();

        for (name, shape) in &shapes {
            match state.get(name) {
                Some(record) if &record.shape != shape => {
                    return Err(NeuroError::IncompatibleCheckpoint(format!(
                        "{name}: checkpoint shape {:?}, model shape {:?}",
                        record.shape, shape
                    )));
                }
                Some(record) if record.data.len() != shape.iter().product::<usize>() => {
                    return Err(NeuroError::IncompatibleCheckpoint(format!(
                        "{name}: {} values for shape {:?}",
                        record.data.len(),
                        shape
                    )));
                }
                Some(_) => report.loaded.push(name.clone()),
                None => report.missing.push(name.clone()),
            }
        }
        report.unexpected = state
            .keys()
            .filter(|k| !shapes.iter().any(|(name, _)| name == *k))
            .cloned()
            .collect();

        if strict && (!report.missing.is_empty() || !report.unexpected.is_empty()) {
            return Err(NeuroError::IncompatibleCheckpoint(format!(
                "strict load: missing {:?}, unexpected {:?}",
                report.missing, report.unexpected
            )));
        }

        self.visit_parameters_mut(&mut |name, mut param| {
            if let Some(record) = state.get(name) {
                for (dst, src) in param.iter_mut().zip(&record.data) {
                    *dst = *src;
                }
            }
        });
        Ok(report)
    }
}
