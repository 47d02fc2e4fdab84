//! Frozen image-side capabilities the training loop consumes.
//!
//! The vision-encoder embedder, the image latent codec, the perceptual
//! embedder and the augmenters are opaque collaborators: the loop only relies
//! on their input/output contracts, expressed here as traits. The reference
//! implementations are small, deterministic and parameter-free at training
//! time (nothing here receives gradients).
//!
//! | Trait | Input | Output |
//! |---|---|---|
//! | [`ImageEmbedder`] | images `(B, C, H, W)` | target embedding `(B, clip_dim)` |
//! | [`LatentCodec`] | images `(B, C, H, W)` | latent `(B, latent_dim)` and back |
//! | [`PerceptualEmbedder`] | images `(B, C, H, W)` | features `(B, perceptual_dim)` |
//! | [`ImageAugmenter`] | images `(B, C, H, W)` | images, same shape |

use crate::core::{NeuroError, NeuroResult};
use ndarray::{Array2, Array4, Axis};
use ndarray_rand::RandomExt;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::Normal;

/// Scale applied to latents by the reference codec.
pub const LATENT_SCALE: f32 = 0.18215;

/// Target embedding of the vision-language encoder.
pub trait ImageEmbedder: Send + Sync {
    fn embed(&self, images: &Array4<f32>) -> NeuroResult<Array2<f32>>;
    fn dim(&self) -> usize;
}

/// Compressed image latent space used by the reconstruction head.
pub trait LatentCodec: Send + Sync {
    fn encode(&self, images: &Array4<f32>) -> NeuroResult<Array2<f32>>;
    fn decode(&self, latents: &Array2<f32>) -> NeuroResult<Array4<f32>>;
    fn latent_dim(&self) -> usize;
}

/// Perceptual features matched by the reconstruction head's auxiliary output.
pub trait PerceptualEmbedder: Send + Sync {
    fn embed_perceptual(&self, images: &Array4<f32>) -> NeuroResult<Array2<f32>>;
    fn perceptual_dim(&self) -> usize;
}

/// Random image augmentation.
pub trait ImageAugmenter: Send + Sync {
    fn augment(&self, images: &Array4<f32>, rng: &mut dyn RngCore) -> Array4<f32>;
}

fn check_shape(images: &Array4<f32>, expected: (usize, usize, usize)) -> NeuroResult<()> {
    let (_, c, h, w) = images.dim();
    if (c, h, w) != expected {
        return Err(NeuroError::ShapeMismatch(format!(
            "images of shape {:?}, encoder expects {:?}",
            (c, h, w),
            expected
        )));
    }
    Ok(())
}

fn flatten(images: &Array4<f32>) -> NeuroResult<Array2<f32>> {
    let (b, c, h, w) = images.dim();
    images
        .as_standard_layout()
        .to_owned()
        .into_shape((b, c * h * w))
        .map_err(|e| NeuroError::ShapeMismatch(e.to_string()))
}

/// Fixed Gaussian random projection of flattened pixels.
///
/// Serves both as the reference target embedder and as the reference
/// perceptual embedder (with a different seed and width).
#[derive(Debug, Clone)]
pub struct RandomProjection {
    image_shape: (usize, usize, usize),
    /// Shape `(dim, C*H*W)`
    projection: Array2<f32>,
}

impl RandomProjection {
    pub fn new(image_shape: (usize, usize, usize), dim: usize, seed: u64) -> NeuroResult<Self> {
        let (c, h, w) = image_shape;
        let inputs = c * h * w;
        if inputs == 0 || dim == 0 {
            return Err(NeuroError::InvalidConfig(format!(
                "random projection from {inputs} pixels to {dim} features"
            )));
        }
        #[allow(clippy::cast_precision_loss)]
        let std = 1.0 / (inputs as f32).sqrt();
        let normal =
            Normal::new(0.0, std).map_err(|e| NeuroError::InvalidConfig(e.to_string()))?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Ok(Self {
            image_shape,
            projection: Array2::random_using((dim, inputs), normal, &mut rng),
        })
    }

    fn project(&self, images: &Array4<f32>) -> NeuroResult<Array2<f32>> {
        check_shape(images, self.image_shape)?;
        Ok(flatten(images)?.dot(&self.projection.t()))
    }
}

impl ImageEmbedder for RandomProjection {
    fn embed(&self, images: &Array4<f32>) -> NeuroResult<Array2<f32>> {
        self.project(images)
    }

    fn dim(&self) -> usize {
        self.projection.nrows()
    }
}

impl PerceptualEmbedder for RandomProjection {
    fn embed_perceptual(&self, images: &Array4<f32>) -> NeuroResult<Array2<f32>> {
        // Centre pixels so features respond to structure, not brightness.
        self.project(&images.mapv(|v| v - 0.5))
    }

    fn perceptual_dim(&self) -> usize {
        self.projection.nrows()
    }
}

/// Average-pooling autoencoder stand-in.
///
/// ```text
/// encode: z = avgpool_p((2x - 1) * 0.18215)
/// decode: x = clamp((upsample_p(z) / 0.18215 + 1) / 2, 0, 1)
/// ```
#[derive(Debug, Clone)]
pub struct PooledLatentCodec {
    image_shape: (usize, usize, usize),
    pool: usize,
}

impl PooledLatentCodec {
    /// # Errors
    /// - `InvalidConfig` if `pool` is zero or does not divide height and width
    pub fn new(image_shape: (usize, usize, usize), pool: usize) -> NeuroResult<Self> {
        let (_, h, w) = image_shape;
        if pool == 0 || h % pool != 0 || w % pool != 0 {
            return Err(NeuroError::InvalidConfig(format!(
                "latent pool {pool} must divide image size {h}x{w}"
            )));
        }
        Ok(Self { image_shape, pool })
    }

    fn latent_grid(&self) -> (usize, usize, usize) {
        let (c, h, w) = self.image_shape;
        (c, h / self.pool, w / self.pool)
    }
}

impl LatentCodec for PooledLatentCodec {
    fn encode(&self, images: &Array4<f32>) -> NeuroResult<Array2<f32>> {
        check_shape(images, self.image_shape)?;
        let b = images.len_of(Axis(0));
        let (c, lh, lw) = self.latent_grid();
        let p = self.pool;
        #[allow(clippy::cast_precision_loss)]
        let area = (p * p) as f32;
        let mut out = Array2::zeros((b, c * lh * lw));
        for n in 0..b {
            for ch in 0..c {
                for y in 0..lh {
                    for x in 0..lw {
                        let mut acc = 0.0;
                        for dy in 0..p {
                            for dx in 0..p {
                                acc += images[[n, ch, y * p + dy, x * p + dx]];
                            }
                        }
                        let mean = acc / area;
                        out[[n, (ch * lh + y) * lw + x]] = (2.0 * mean - 1.0) * LATENT_SCALE;
                    }
                }
            }
        }
        Ok(out)
    }

    fn decode(&self, latents: &Array2<f32>) -> NeuroResult<Array4<f32>> {
        if latents.ncols() != self.latent_dim() {
            return Err(NeuroError::ShapeMismatch(format!(
                "latent width {}, codec expects {}",
                latents.ncols(),
                self.latent_dim()
            )));
        }
        let (c, h, w) = self.image_shape;
        let (_, _, lw) = self.latent_grid();
        let lh = h / self.pool;
        let p = self.pool;
        let b = latents.nrows();
        Ok(Array4::from_shape_fn((b, c, h, w), |(n, ch, y, x)| {
            let z = latents[[n, (ch * lh + y / p) * lw + x / p]];
            ((z / LATENT_SCALE + 1.0) / 2.0).clamp(0.0, 1.0)
        }))
    }

    fn latent_dim(&self) -> usize {
        let (c, lh, lw) = self.latent_grid();
        c * lh * lw
    }
}

/// Per-image brightness and contrast jitter, clamped to [0, 1].
#[derive(Debug, Clone, Copy)]
pub struct ColorJitter {
    pub brightness: f32,
    pub contrast: f32,
    /// Probability that an image is jittered at all
    pub p: f64,
}

impl ColorJitter {
    /// Mild jitter applied to training images before target embedding.
    pub fn mild() -> Self {
        Self {
            brightness: 0.1,
            contrast: 0.1,
            p: 0.5,
        }
    }

    /// Stronger jitter for the reconstruction contrastive term.
    pub fn strong() -> Self {
        Self {
            brightness: 0.4,
            contrast: 0.4,
            p: 0.8,
        }
    }
}

impl ImageAugmenter for ColorJitter {
    fn augment(&self, images: &Array4<f32>, rng: &mut dyn RngCore) -> Array4<f32> {
        let mut out = images.clone();
        for mut image in out.outer_iter_mut() {
            if !rng.gen_bool(self.p) {
                continue;
            }
            let brightness = 1.0 + rng.gen_range(-self.brightness..=self.brightness);
            let contrast = 1.0 + rng.gen_range(-self.contrast..=self.contrast);
            let mean = image.mean().unwrap_or(0.0);
            image.mapv_inplace(|v| (((v - mean) * contrast + mean) * brightness).clamp(0.0, 1.0));
        }
        out
    }
}

/// The full set of frozen encoders used by training and evaluation.
pub struct Encoders {
    pub clip: Box<dyn ImageEmbedder>,
    pub latent: Box<dyn LatentCodec>,
    pub perceptual: Box<dyn PerceptualEmbedder>,
    /// Applied before the target embedding when image augmentation is on
    pub train_aug: Box<dyn ImageAugmenter>,
    /// Applied to the second view of the reconstruction contrastive term
    pub blur_aug: Box<dyn ImageAugmenter>,
}

impl Encoders {
    /// Deterministic reference encoders for the given image shape.
    pub fn reference(
        image_shape: (usize, usize, usize),
        clip_dim: usize,
        perceptual_dim: usize,
        latent_pool: usize,
        seed: u64,
    ) -> NeuroResult<Self> {
        Ok(Self {
            clip: Box::new(RandomProjection::new(image_shape, clip_dim, seed)?),
            latent: Box::new(PooledLatentCodec::new(image_shape, latent_pool)?),
            perceptual: Box::new(RandomProjection::new(
                image_shape,
                perceptual_dim,
                seed.wrapping_add(1),
            )?),
            train_aug: Box::new(ColorJitter::mild()),
            blur_aug: Box::new(ColorJitter::strong()),
        })
    }
}

impl std::fmt::Debug for Encoders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoders")
            .field("clip_dim", &self.clip.dim())
            .field("latent_dim", &self.latent.latent_dim())
            .field("perceptual_dim", &self.perceptual.perceptual_dim())
            .finish_non_exhaustive()
    }
}
