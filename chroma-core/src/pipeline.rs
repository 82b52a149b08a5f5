use candle_core::Tensor;

use crate::{Error, LatentSize, Result};

/// Everything that determines what a generation run produces.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationConfig {
    pub prompt: String,
    pub neg_prompt: String,
    pub n_images: usize,
    pub num_steps: usize,
    pub latent_size: LatentSize,
    pub seed: u64,
    pub cfg: f64,
    /// Number of leading denoising steps that run without classifier-free guidance.
    pub first_n_steps_without_cfg: usize,
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_images == 0 {
            return Err(Error::NotPositive { what: "n_images" });
        }
        if self.num_steps == 0 {
            return Err(Error::NotPositive { what: "num_steps" });
        }
        Ok(())
    }

    /// Whether guidance applies at the zero-based denoising step `step`.
    pub fn uses_cfg_at(&self, step: usize) -> bool {
        self.cfg != 1.0 && step >= self.first_n_steps_without_cfg
    }
}

/// Sub-models whose memory the orchestrator may hand back between stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    TextEncoder,
    Flow,
}

/// A finite, single-pass sequence of tensors produced by [`Pipeline::generate_latents`].
///
/// Item 0 is the conditioning tensor; every following item is the latent batch after one
/// more denoising step. Pulling advances the diffusion state, which lives inside the
/// sequence, so it cannot be rewound.
pub trait LatentStream {
    fn has_next(&self) -> bool;

    /// Compute and return the next item. Errors with [`Error::SequenceExhausted`] once empty.
    fn pull(&mut self) -> Result<Tensor>;
}

/// The diffusion model as seen by the orchestrator.
pub trait Pipeline {
    /// Start a lazy generation run. Nothing heavy is computed until the stream is pulled.
    fn generate_latents(&mut self, config: &GenerationConfig) -> Result<Box<dyn LatentStream>>;

    /// Decode a latent batch into a `(B, H, W, C)` pixel batch with values in `[0, 1]`.
    fn decode(&mut self, latents: &Tensor, latent_size: LatentSize) -> Result<Tensor>;

    /// Load every sub-model now instead of on first use.
    fn ensure_models_are_loaded(&mut self) -> Result<()>;

    /// Drop the pipeline's own reference to a sub-model. Must be idempotent and never
    /// required for a run to succeed.
    fn release(&mut self, model: ModelKind);
}

/// Block until every queued computation producing `tensor` has finished.
pub fn materialize(tensor: &Tensor) -> Result<()> {
    tensor.device().synchronize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GenerationConfig {
        GenerationConfig {
            prompt: "a lighthouse at dusk".to_string(),
            neg_prompt: String::new(),
            n_images: 2,
            num_steps: 4,
            latent_size: LatentSize {
                height: 64,
                width: 64,
            },
            seed: 666,
            cfg: 4.0,
            first_n_steps_without_cfg: 2,
        }
    }

    #[test]
    fn cfg_skips_leading_steps() {
        let config = config();
        let guided: Vec<bool> = (0..4).map(|s| config.uses_cfg_at(s)).collect();
        assert_eq!(guided, [false, false, true, true]);
    }

    #[test]
    fn unit_scale_never_guides() {
        let config = GenerationConfig {
            cfg: 1.0,
            first_n_steps_without_cfg: 0,
            ..config()
        };
        assert!((0..4).all(|s| !config.uses_cfg_at(s)));
    }

    #[test]
    fn rejects_empty_runs() {
        assert!(config().validate().is_ok());
        let no_images = GenerationConfig {
            n_images: 0,
            ..config()
        };
        assert!(matches!(
            no_images.validate(),
            Err(Error::NotPositive { what: "n_images" })
        ));
        let no_steps = GenerationConfig {
            num_steps: 0,
            ..config()
        };
        assert!(no_steps.validate().is_err());
    }
}
