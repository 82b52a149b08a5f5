use std::{path::Path, sync::Mutex};

use anyhow::{anyhow, Context, Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::{
    models::{
        flux::{self, autoencoder::AutoEncoder, WithForward},
        t5::{self, T5EncoderModel},
    },
    quantized_var_builder,
};
use tokenizers::Tokenizer;

use crate::{
    artifacts::{flow_variant, FlowVariant},
    ModelFiles,
};

/// Prompts are padded or cut to this many T5 tokens.
pub(crate) const T5_MAX_TOKENS: usize = 256;

pub(crate) struct TextEncoder {
    model: Mutex<T5EncoderModel>,
    tokenizer: Tokenizer,
}

impl TextEncoder {
    pub(crate) fn load(files: &ModelFiles, dtype: DType, device: &Device) -> Result<Self> {
        let vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(files.t5_weights.as_slice(), dtype, device)
                .context("failed to build T5 var builder")?
        };
        let config_str =
            std::fs::read_to_string(&files.t5_config).context("failed to read T5 config")?;
        let config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let model = T5EncoderModel::load(vb, &config).context("failed to load T5 model")?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;
        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
        })
    }

    /// Embed one prompt as a `(1, T5_MAX_TOKENS, dim)` tensor.
    pub(crate) fn encode(&self, prompt: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.resize(T5_MAX_TOKENS, 0);
        let input_ids = Tensor::new(&*tokens, device)?.unsqueeze(0)?;
        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow!("T5 model lock poisoned"))?;
        Ok(model.forward(&input_ids)?)
    }
}

enum FlowWeights {
    Full(flux::model::Flux),
    Quantized(flux::quantized_model::Flux),
}

/// The flow-matching transformer, full precision or GGUF-quantized.
pub(crate) struct FlowModel {
    weights: FlowWeights,
    config: flux::model::Config,
}

impl FlowModel {
    pub(crate) fn load(path: &Path, quantized: bool, dtype: DType, device: &Device) -> Result<Self> {
        let config = match flow_variant(path)? {
            FlowVariant::Dev => flux::model::Config::dev(),
            FlowVariant::Schnell => flux::model::Config::schnell(),
        };
        let weights = if quantized {
            let vb = quantized_var_builder::VarBuilder::from_gguf(path, device)
                .context("failed to build quantized flow var builder")?;
            FlowWeights::Quantized(
                flux::quantized_model::Flux::new(&config, vb)
                    .context("failed to load quantized flow model")?,
            )
        } else {
            let vb = unsafe {
                candle_nn::VarBuilder::from_mmaped_safetensors(&[path], dtype, device)
                    .context("failed to build flow var builder")?
            };
            FlowWeights::Full(
                flux::model::Flux::new(&config, vb).context("failed to load flow model")?,
            )
        };
        Ok(Self { weights, config })
    }

    /// Width of the pooled-text vector the network expects.
    pub(crate) fn vec_in_dim(&self) -> usize {
        self.config.vec_in_dim
    }

    pub(crate) fn embeds_guidance(&self) -> bool {
        self.config.guidance_embed
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn forward(
        &self,
        img: &Tensor,
        img_ids: &Tensor,
        txt: &Tensor,
        txt_ids: &Tensor,
        timesteps: &Tensor,
        y: &Tensor,
        guidance: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        match &self.weights {
            FlowWeights::Full(m) => m.forward(img, img_ids, txt, txt_ids, timesteps, y, guidance),
            FlowWeights::Quantized(m) => {
                m.forward(img, img_ids, txt, txt_ids, timesteps, y, guidance)
            }
        }
    }
}

pub(crate) fn load_autoencoder(
    path: &Path,
    dtype: DType,
    device: &Device,
) -> Result<AutoEncoder> {
    let vb = unsafe {
        candle_nn::VarBuilder::from_mmaped_safetensors(&[path], dtype, device)
            .context("failed to build autoencoder var builder")?
    };
    AutoEncoder::new(&flux::autoencoder::Config::dev(), vb).context("failed to load autoencoder")
}
