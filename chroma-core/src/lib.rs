//! Orchestration of text-to-image diffusion runs.
//!
//! A run resolves the latent size, pulls a lazy latent sequence from a [`Pipeline`] through
//! conditioning and denoising, decodes the final latents in sub-batches and writes the
//! images out, recording per-phase peak memory along the way.
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use chroma_core::{
//!     generate, resolve, save_images, AllocatorMemory, ChromaLoader, DeviceMap,
//!     GenerationConfig, ImageSize, LoadOptions, Loader, ModelPaths, OutputMode, StageOptions,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut pipeline =
//!     ChromaLoader::load(ModelPaths::default(), LoadOptions::default(), DeviceMap::default())
//!         .await?;
//! let config = GenerationConfig {
//!     prompt: "A lighthouse in a storm".to_string(),
//!     neg_prompt: String::new(),
//!     n_images: 4,
//!     num_steps: 28,
//!     latent_size: resolve(ImageSize::new(512, 512)?).latent,
//!     seed: 666,
//!     cfg: 4.0,
//!     first_n_steps_without_cfg: 0,
//! };
//! let generation = generate(&mut pipeline, &config, 1, &AllocatorMemory, StageOptions::default())?;
//! save_images(&generation.decoded, OutputMode::Grid { n_rows: 2 }, Path::new("out.png"))?;
//! println!("{}", generation.telemetry.report());
//! # Ok(())
//! # }
//! ```

pub mod artifacts;
pub mod device_map;
pub mod error;
pub mod handle;
pub mod latent;
pub mod loader;
pub mod memory;
pub mod output;
pub mod pipeline;

mod chroma;
mod decode;
mod run;
mod stages;
mod util;

pub use artifacts::{flow_variant, FlowVariant, ModelFiles, ModelPaths};
pub use chroma::{ChromaLoader, ChromaPipeline};
pub use decode::{decode_all, sub_batches};
pub use device_map::*;
pub use error::{Error, Result};
pub use handle::ModelHandle;
pub use latent::{resolve, ImageSize, LatentSize, ResolvedSize};
pub use loader::*;
pub use memory::{AllocatorMemory, MemoryTracker, Telemetry, TrackingAllocator};
pub use output::{quantize, raw_file_names, save_images, tile_grid, OutputMode};
pub use pipeline::{materialize, GenerationConfig, LatentStream, ModelKind, Pipeline};
pub use run::{generate, Generation};
pub use stages::{run_stages, Denoised, StageOptions};
pub(crate) use util::progress_bar;
pub use util::tensor_to_image;
