use std::path::PathBuf;

use anyhow::Result;
use chroma_core::{
    generate, resolve, save_images, AllocatorMemory, ChromaLoader, DeviceMap, Error,
    GenerationConfig, ImageSize, LoadOptions, Loader, ModelPaths, OutputMode, Pipeline,
    StageOptions, TrackingAllocator,
};
use clap::Parser;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static ALLOCATOR: TrackingAllocator = TrackingAllocator;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Generate images from a textual prompt using a Chroma diffusion model"
)]
struct Args {
    /// The prompt to render
    prompt: String,

    /// Negative prompt used for classifier-free guidance
    #[arg(long, default_value = "")]
    neg_prompt: String,

    /// Flow transformer checkpoint (a .gguf file with --quantize)
    #[arg(
        long,
        default_value = "./models/chroma/chroma-unlocked-v36-detail-calibrated.safetensors"
    )]
    chroma_path: PathBuf,

    /// T5 text encoder directory or safetensors file
    #[arg(long, default_value = "./models/t5/text_encoder_2")]
    t5_path: PathBuf,

    /// T5 tokenizer directory or tokenizer.json file
    #[arg(long, default_value = "./models/t5/tokenizer_2")]
    tokenizer_path: PathBuf,

    /// Autoencoder directory or safetensors file
    #[arg(long, default_value = "./models/vae")]
    vae_path: PathBuf,

    /// Fetch the model weights from the Hugging Face Hub
    #[arg(long)]
    download_hf: bool,

    /// Number of images to generate
    #[arg(long, default_value_t = 1)]
    n_images: usize,

    /// Image size as WIDTHxHEIGHT, rounded up to a multiple of 16
    #[arg(long, default_value = "512x512")]
    image_size: ImageSize,

    /// Number of denoising steps
    #[arg(long, default_value_t = 28)]
    steps: usize,

    /// Classifier-free guidance scale
    #[arg(long, default_value_t = 4.0)]
    cfg: f64,

    /// Number of initial steps that run without guidance
    #[arg(long, default_value_t = 0)]
    skip_cfg_steps: usize,

    /// Rows of the output grid
    #[arg(long, default_value_t = 1)]
    n_rows: usize,

    /// Number of images decoded at once
    #[arg(long, default_value_t = 1)]
    decoding_batch_size: usize,

    /// Load the quantized flow transformer
    #[arg(short, long)]
    quantize: bool,

    /// Load every model before generation instead of on first use
    #[arg(long)]
    preload_models: bool,

    /// Output image path
    #[arg(long, default_value = "out.png")]
    output: PathBuf,

    /// Save every image to its own file instead of a grid
    #[arg(long)]
    save_raw: bool,

    /// Random seed
    #[arg(long, default_value_t = 666)]
    seed: u64,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Print peak memory and timing
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn output_mode(&self) -> OutputMode {
        if self.save_raw {
            OutputMode::Raw
        } else {
            OutputMode::Grid {
                n_rows: self.n_rows,
            }
        }
    }

    fn model_paths(&self) -> ModelPaths {
        ModelPaths {
            chroma: self.chroma_path.clone(),
            t5: self.t5_path.clone(),
            tokenizer: self.tokenizer_path.clone(),
            vae: self.vae_path.clone(),
        }
    }

    fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            prompt: self.prompt.clone(),
            neg_prompt: self.neg_prompt.clone(),
            n_images: self.n_images,
            num_steps: self.steps,
            latent_size: resolve(self.image_size).latent,
            seed: self.seed,
            cfg: self.cfg,
            first_n_steps_without_cfg: self.skip_cfg_steps,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Reject bad layouts before spending time on model loading.
    let config = args.generation_config();
    config.validate()?;
    let mode = args.output_mode();
    mode.validate(config.n_images, &args.output)?;
    if args.decoding_batch_size == 0 {
        return Err(Error::NotPositive {
            what: "decoding batch size",
        }
        .into());
    }
    info!("Generating {} image(s)", config.n_images);

    let options = LoadOptions {
        download_hf: args.download_hf,
        quantized: args.quantize,
    };
    let mut pipeline =
        ChromaLoader::load(args.model_paths(), options, DeviceMap::from_cpu_flag(args.cpu))
            .await?;
    if args.preload_models {
        pipeline.ensure_models_are_loaded()?;
    }

    let generation = generate(
        &mut pipeline,
        &config,
        args.decoding_batch_size,
        &AllocatorMemory,
        StageOptions::default(),
    )?;
    save_images(&generation.decoded, mode, &args.output)?;

    if args.verbose {
        println!("{}", generation.telemetry.report());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chroma_core::LatentSize;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["txt2image", "a cat"]).unwrap();
        assert_eq!(args.image_size, ImageSize::new(512, 512).unwrap());
        assert_eq!(args.steps, 28);
        assert_eq!(args.seed, 666);
        assert_eq!(args.output, PathBuf::from("out.png"));
        assert_eq!(args.output_mode(), OutputMode::Grid { n_rows: 1 });
        assert_eq!(args.model_paths(), ModelPaths::default());

        let config = args.generation_config();
        assert_eq!(
            config.latent_size,
            LatentSize {
                height: 64,
                width: 64
            }
        );
        assert_eq!(config.cfg, 4.0);
        assert_eq!(config.first_n_steps_without_cfg, 0);
    }

    #[test]
    fn parses_options() {
        let args = Args::try_parse_from([
            "txt2image",
            "a cat",
            "--image-size",
            "1000x600",
            "--n-images",
            "4",
            "--n-rows",
            "2",
            "--save-raw",
            "-q",
            "-v",
        ])
        .unwrap();
        assert!(args.quantize && args.verbose);
        assert_eq!(args.output_mode(), OutputMode::Raw);
        assert_eq!(
            args.generation_config().latent_size,
            LatentSize {
                height: 76,
                width: 126
            }
        );
    }

    #[test]
    fn raw_output_needs_an_extension() {
        let args =
            Args::try_parse_from(["txt2image", "a cat", "--save-raw", "--output", "renders/out"])
                .unwrap();
        let err = args.output_mode().validate(1, &args.output).unwrap_err();
        assert!(matches!(err, Error::MissingExtension(_)));

        let args = Args::try_parse_from(["txt2image", "a cat", "--output", "renders/out"]).unwrap();
        assert!(args.output_mode().validate(1, &args.output).is_ok());
    }

    #[test]
    fn rejects_malformed_image_size() {
        assert!(Args::try_parse_from(["txt2image", "a cat", "--image-size", "512"]).is_err());
        assert!(Args::try_parse_from(["txt2image", "a cat", "--image-size", "ax2"]).is_err());
    }
}
