use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::flux::{autoencoder::AutoEncoder, sampling};
use hf_hub::api::tokio::Api;
use tracing::info;

mod models;
mod stream;

use models::{load_autoencoder, FlowModel, TextEncoder};
use stream::ChromaStream;

use crate::{
    artifacts::flow_variant, DeviceMap, GenerationConfig, LatentSize, LatentStream, Loader,
    LoadOptions, ModelFiles, ModelHandle, ModelKind, ModelPaths, Pipeline,
};

/// Text-to-image pipeline over a T5 text encoder, a Flux-family flow transformer and the
/// Flux autoencoder. Sub-models load on first use.
pub struct ChromaPipeline {
    device: Device,
    dtype: DType,
    files: ModelFiles,
    quantized: bool,
    t5: ModelHandle<TextEncoder>,
    flow: ModelHandle<FlowModel>,
    vae: ModelHandle<AutoEncoder>,
}

impl ChromaPipeline {
    pub fn new(files: ModelFiles, quantized: bool, device: Device) -> Self {
        let dtype = device.bf16_default_to_f32();
        Self {
            device,
            dtype,
            files,
            quantized,
            t5: ModelHandle::new("T5 text encoder"),
            flow: ModelHandle::new("flow transformer"),
            vae: ModelHandle::new("autoencoder"),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn text_encoder(&mut self) -> Result<std::sync::Arc<TextEncoder>> {
        let (files, dtype, device) = (&self.files, self.dtype, &self.device);
        self.t5.get_or_load(|| TextEncoder::load(files, dtype, device))
    }

    fn flow(&mut self) -> Result<std::sync::Arc<FlowModel>> {
        let (path, quantized, dtype, device) =
            (&self.files.flow, self.quantized, self.dtype, &self.device);
        self.flow
            .get_or_load(|| FlowModel::load(path, quantized, dtype, device))
    }

    fn autoencoder(&mut self) -> Result<std::sync::Arc<AutoEncoder>> {
        let (path, dtype, device) = (&self.files.vae, self.dtype, &self.device);
        self.vae
            .get_or_load(|| load_autoencoder(path, dtype, device))
    }
}

impl Pipeline for ChromaPipeline {
    fn generate_latents(
        &mut self,
        config: &GenerationConfig,
    ) -> crate::Result<Box<dyn LatentStream>> {
        config.validate()?;
        let text_encoder = self.text_encoder()?;
        let flow = self.flow()?;
        let stream = ChromaStream::new(
            config.clone(),
            self.device.clone(),
            self.dtype,
            text_encoder,
            flow,
        )?;
        Ok(Box::new(stream))
    }

    fn decode(&mut self, latents: &Tensor, latent_size: LatentSize) -> crate::Result<Tensor> {
        let vae = self.autoencoder()?;
        let size = latent_size.image_size();
        let latents = sampling::unpack(&latents.to_dtype(self.dtype)?, size.height, size.width)?;
        let images = vae.decode(&latents)?;
        let images = ((images.clamp(-1f32, 1f32)? + 1.0)? * 0.5)?
            .permute((0, 2, 3, 1))?
            .to_dtype(DType::F32)?
            .contiguous()?;
        Ok(images)
    }

    fn ensure_models_are_loaded(&mut self) -> crate::Result<()> {
        self.text_encoder()?;
        self.flow()?;
        self.autoencoder()?;
        Ok(())
    }

    fn release(&mut self, model: ModelKind) {
        match model {
            ModelKind::TextEncoder => self.t5.release(),
            ModelKind::Flow => self.flow.release(),
        }
    }
}

pub struct ChromaLoader;

impl Loader for ChromaLoader {
    type Model = ChromaPipeline;

    async fn load(
        paths: ModelPaths,
        options: LoadOptions,
        device_map: DeviceMap,
    ) -> Result<Self::Model> {
        let device = device_map.open().context("failed to set up device")?;

        let files = if options.download_hf {
            if options.quantized {
                bail!("quantized flow checkpoints must be provided locally");
            }
            let api = Api::new().context("failed to create hf hub API")?;
            paths.download(&api).await?
        } else {
            paths.locate()?
        };
        let variant = flow_variant(&files.flow)?;
        info!(
            "Using flow checkpoint {} ({variant:?})",
            files.flow.display()
        );

        Ok(ChromaPipeline::new(files, options.quantized, device))
    }
}
