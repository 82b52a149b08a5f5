use candle_core::Tensor;

use crate::{
    decode_all, run_stages, GenerationConfig, MemoryTracker, Pipeline, Result, StageOptions,
    Telemetry,
};

/// Decoded images of one run, still split into decode sub-batches, plus its telemetry.
#[derive(Debug)]
pub struct Generation {
    pub decoded: Vec<Tensor>,
    pub telemetry: Telemetry,
}

/// Conditioning, denoising and decoding, strictly one after the other.
pub fn generate<P>(
    pipeline: &mut P,
    config: &GenerationConfig,
    decoding_batch_size: usize,
    memory: &dyn MemoryTracker,
    options: StageOptions,
) -> Result<Generation>
where
    P: Pipeline + ?Sized,
{
    let denoised = run_stages(pipeline, config, memory, options)?;
    let mut telemetry = denoised.telemetry;
    let decoded = decode_all(
        pipeline,
        &denoised.latents,
        config.latent_size,
        decoding_batch_size,
        options.show_progress,
    )?;
    telemetry.peak_decoding = memory.read_peak();
    Ok(Generation { decoded, telemetry })
}
