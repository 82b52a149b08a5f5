use std::future::Future;

use anyhow::Result;

use crate::{DeviceMap, ModelPaths, Pipeline};

/// How model artifacts are obtained.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Fetch the artifacts from the Hugging Face Hub instead of the given paths.
    pub download_hf: bool,
    /// Load the GGUF-quantized flow network.
    pub quantized: bool,
}

pub trait Loader {
    type Model: Pipeline;

    fn load(
        paths: ModelPaths,
        options: LoadOptions,
        device_map: DeviceMap,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
