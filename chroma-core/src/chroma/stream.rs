use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_transformers::models::flux::sampling;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use tracing::debug;

use super::models::{FlowModel, TextEncoder};
use crate::{Error, GenerationConfig, LatentStream, Result};

/// Guidance fed to checkpoints that were distilled with an embedded guidance scale.
const DISTILLED_GUIDANCE: f64 = 3.5;

/// Seeded standard-normal noise of shape `(n, 16, latent_h, latent_w)`.
pub(crate) fn seeded_noise(config: &GenerationConfig, device: &Device) -> Result<Tensor> {
    let shape = (
        config.n_images,
        16,
        config.latent_size.height,
        config.latent_size.width,
    );
    let len = shape.0 * shape.1 * shape.2 * shape.3;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let data: Vec<f32> = (0..len).map(|_| StandardNormal.sample(&mut rng)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

struct DenoiseState {
    img: Tensor,
    img_ids: Tensor,
    txt: Tensor,
    txt_ids: Tensor,
    vec: Tensor,
    neg_txt: Option<Tensor>,
}

/// Latent sequence backed by the candle models.
///
/// Keeps its own references to the models so that the pipeline can release its handles
/// mid-run; the text encoder reference is dropped as soon as conditioning is done.
pub(crate) struct ChromaStream {
    config: GenerationConfig,
    device: Device,
    dtype: DType,
    text_encoder: Option<Arc<TextEncoder>>,
    flow: Arc<FlowModel>,
    noise: Option<Tensor>,
    timesteps: Vec<f64>,
    state: Option<DenoiseState>,
    pulled: usize,
}

impl ChromaStream {
    pub(crate) fn new(
        config: GenerationConfig,
        device: Device,
        dtype: DType,
        text_encoder: Arc<TextEncoder>,
        flow: Arc<FlowModel>,
    ) -> Result<Self> {
        let noise = seeded_noise(&config, &device)?.to_dtype(dtype)?;
        let image_seq_len = (config.latent_size.height / 2) * (config.latent_size.width / 2);
        let timesteps = sampling::get_schedule(config.num_steps, Some((image_seq_len, 0.5, 1.15)));
        Ok(Self {
            config,
            device,
            dtype,
            text_encoder: Some(text_encoder),
            flow,
            noise: Some(noise),
            timesteps,
            state: None,
            pulled: 0,
        })
    }

    fn needs_negative(&self) -> bool {
        (0..self.config.num_steps).any(|step| self.config.uses_cfg_at(step))
    }

    fn condition(&mut self) -> Result<Tensor> {
        let (Some(text_encoder), Some(noise)) = (self.text_encoder.take(), self.noise.take())
        else {
            return Err(Error::SequenceExhausted {
                pulled: self.pulled,
                expected: self.config.num_steps + 1,
            });
        };
        let txt = text_encoder.encode(&self.config.prompt, &self.device)?;
        let neg = if self.needs_negative() {
            Some(text_encoder.encode(&self.config.neg_prompt, &self.device)?)
        } else {
            None
        };
        drop(text_encoder);

        let clip = Tensor::zeros((1, self.flow.vec_in_dim()), self.dtype, &self.device)?;
        let state = sampling::State::new(&txt, &clip, &noise)?;
        let neg_txt = neg
            .as_ref()
            .map(|neg| neg.repeat((self.config.n_images, 1, 1)))
            .transpose()?;
        let conditioning = match &neg {
            Some(neg) => Tensor::cat(&[&txt, neg], 0)?,
            None => txt,
        };
        self.state = Some(DenoiseState {
            img: state.img,
            img_ids: state.img_ids,
            txt: state.txt,
            txt_ids: state.txt_ids,
            vec: state.vec,
            neg_txt,
        });
        Ok(conditioning)
    }

    fn denoise_step(&mut self, step: usize) -> Result<Tensor> {
        let (t_curr, t_prev) = (self.timesteps[step], self.timesteps[step + 1]);
        let guided = self.config.uses_cfg_at(step);
        let cfg = self.config.cfg;
        let bs = self.config.n_images;
        let state = self.state.as_mut().ok_or(Error::SequenceExhausted {
            pulled: self.pulled,
            expected: self.config.num_steps + 1,
        })?;

        let t_vec = Tensor::full(t_curr as f32, bs, &self.device)?.to_dtype(self.dtype)?;
        let guidance = if self.flow.embeds_guidance() {
            Some(Tensor::full(DISTILLED_GUIDANCE as f32, bs, &self.device)?.to_dtype(self.dtype)?)
        } else {
            None
        };
        let forward = |txt: &Tensor| {
            self.flow.forward(
                &state.img,
                &state.img_ids,
                txt,
                &state.txt_ids,
                &t_vec,
                &state.vec,
                guidance.as_ref(),
            )
        };
        let cond = forward(&state.txt)?;
        let pred = match (&state.neg_txt, guided) {
            (Some(neg_txt), true) => {
                let uncond = forward(neg_txt)?;
                (&uncond + ((cond - &uncond)? * cfg)?)?
            }
            _ => cond,
        };
        state.img = (&state.img + (pred * (t_prev - t_curr))?)?;
        debug!("Denoising step {} (t = {t_curr:.4}, cfg: {guided})", step + 1);
        Ok(state.img.clone())
    }
}

impl LatentStream for ChromaStream {
    fn has_next(&self) -> bool {
        self.pulled < self.config.num_steps + 1
    }

    fn pull(&mut self) -> Result<Tensor> {
        if !self.has_next() {
            return Err(Error::SequenceExhausted {
                pulled: self.pulled,
                expected: self.config.num_steps + 1,
            });
        }
        let item = if self.pulled == 0 {
            self.condition()?
        } else {
            self.denoise_step(self.pulled - 1)?
        };
        self.pulled += 1;
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LatentSize;

    fn config(seed: u64) -> GenerationConfig {
        GenerationConfig {
            prompt: "a red bicycle".to_string(),
            neg_prompt: String::new(),
            n_images: 2,
            num_steps: 4,
            latent_size: LatentSize {
                height: 8,
                width: 6,
            },
            seed,
            cfg: 4.0,
            first_n_steps_without_cfg: 0,
        }
    }

    #[test]
    fn noise_is_seeded() {
        let a = seeded_noise(&config(666), &Device::Cpu).unwrap();
        let b = seeded_noise(&config(666), &Device::Cpu).unwrap();
        let c = seeded_noise(&config(667), &Device::Cpu).unwrap();
        assert_eq!(a.dims(), [2, 16, 8, 6]);
        let flat = |t: &Tensor| t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(flat(&a), flat(&b));
        assert_ne!(flat(&a), flat(&c));
    }
}
