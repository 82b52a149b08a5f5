use std::time::Instant;

use candle_core::Tensor;
use tracing::{debug, info};

use crate::{
    materialize, progress_bar, Error, GenerationConfig, LatentStream, MemoryTracker, ModelKind,
    Pipeline, Result, Telemetry,
};

/// Knobs for the staged run that do not affect its output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageOptions {
    /// Drop the text encoder after conditioning and the flow network after denoising.
    pub release_models: bool,
    pub show_progress: bool,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            release_models: true,
            show_progress: true,
        }
    }
}

/// Result of the conditioning and denoising stages.
#[derive(Debug)]
pub struct Denoised {
    /// Latent batch after the last denoising step.
    pub latents: Tensor,
    pub telemetry: Telemetry,
}

fn pull_next(stream: &mut dyn LatentStream, pulled: usize, expected: usize) -> Result<Tensor> {
    if !stream.has_next() {
        return Err(Error::SequenceExhausted { pulled, expected });
    }
    stream.pull()
}

/// Drive a latent sequence through conditioning and denoising.
///
/// Exactly `num_steps + 1` items are pulled: the conditioning tensor, then one latent per
/// step. Each pull is followed by an evaluation barrier so that peak memory is bounded by a
/// single step. Phase peaks are read and reset at both stage boundaries; the decoding peak
/// is left at zero for the caller to fill in.
pub fn run_stages<P>(
    pipeline: &mut P,
    config: &GenerationConfig,
    memory: &dyn MemoryTracker,
    options: StageOptions,
) -> Result<Denoised>
where
    P: Pipeline + ?Sized,
{
    config.validate()?;
    let expected = config.num_steps + 1;
    let mut telemetry = Telemetry::default();
    let mut stream = pipeline.generate_latents(config)?;

    let conditioning = pull_next(stream.as_mut(), 0, expected)?;
    materialize(&conditioning)?;
    drop(conditioning);
    telemetry.peak_conditioning = memory.read_peak();
    memory.reset_peak();
    debug!("Conditioning done");

    if options.release_models {
        pipeline.release(ModelKind::TextEncoder);
    }

    let start = Instant::now();
    let bar = progress_bar(config.num_steps, options.show_progress);
    let mut latents = None;
    for step in 0..config.num_steps {
        let x_t = pull_next(stream.as_mut(), step + 1, expected)?;
        materialize(&x_t)?;
        latents = Some(x_t);
        bar.inc(1);
    }
    bar.finish_and_clear();
    telemetry.denoising_time = start.elapsed();
    if stream.has_next() {
        return Err(Error::SequenceOverrun { expected });
    }
    drop(stream);
    info!(
        "Denoised {} steps in {:.2}s",
        config.num_steps,
        telemetry.denoising_time.as_secs_f64()
    );

    if options.release_models {
        pipeline.release(ModelKind::Flow);
    }
    telemetry.peak_generation = memory.read_peak();
    memory.reset_peak();

    let latents = latents.ok_or(Error::NotPositive { what: "num_steps" })?;
    Ok(Denoised { latents, telemetry })
}
