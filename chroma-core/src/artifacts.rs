use std::{
    fs::File,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use candle_core::{quantized::gguf_file, safetensors::MmapedSafetensors};
use hf_hub::api::tokio::Api;
use tracing::info;

const CHROMA_REPO: &str = "lodestones/Chroma";
const T5_REPO: &str = "google/t5-v1_1-xxl";
const T5_REVISION: &str = "refs/pr/2";
const T5_TOKENIZER_REPO: &str = "lmz/mt5-tokenizers";
const T5_TOKENIZER_FILE: &str = "t5-v1_1-xxl.tokenizer.json";
const VAE_REPO: &str = "black-forest-labs/FLUX.1-schnell";
const VAE_FILE: &str = "ae.safetensors";

/// Tensor present only in checkpoints that embed a distilled guidance scale.
const GUIDANCE_TENSOR: &str = "guidance_in.in_layer.weight";
/// Chroma checkpoints carry this guidance approximator instead of Flux's per-block
/// modulation, `time_in` and `vector_in` weights.
const CHROMA_GUIDANCE_PREFIX: &str = "distilled_guidance_layer.";

/// Where the user said the model artifacts live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelPaths {
    pub chroma: PathBuf,
    pub t5: PathBuf,
    pub tokenizer: PathBuf,
    pub vae: PathBuf,
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self {
            chroma: "./models/chroma/chroma-unlocked-v36-detail-calibrated.safetensors".into(),
            t5: "./models/t5/text_encoder_2".into(),
            tokenizer: "./models/t5/tokenizer_2".into(),
            vae: "./models/vae".into(),
        }
    }
}

/// Concrete files to load the pipeline from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelFiles {
    pub flow: PathBuf,
    pub t5_weights: Vec<PathBuf>,
    pub t5_config: PathBuf,
    pub tokenizer: PathBuf,
    pub vae: PathBuf,
}

fn safetensors_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect::<Vec<_>>();
    files.sort();
    if files.is_empty() {
        bail!("no .safetensors files in {}", dir.display());
    }
    Ok(files)
}

fn existing(path: PathBuf, what: &str) -> Result<PathBuf> {
    if !path.exists() {
        bail!("{what} not found at {}", path.display());
    }
    Ok(path)
}

impl ModelPaths {
    /// Resolve the paths on the local filesystem.
    ///
    /// Directories are searched the way the Hugging Face layouts store them: sharded
    /// `*.safetensors` plus `config.json` for T5, `tokenizer.json` for the tokenizer and
    /// `ae.safetensors` for the autoencoder.
    pub fn locate(&self) -> Result<ModelFiles> {
        let flow = existing(self.chroma.clone(), "flow checkpoint")?;

        let (t5_weights, t5_config) = if self.t5.is_dir() {
            (
                safetensors_in(&self.t5)?,
                existing(self.t5.join("config.json"), "T5 config")?,
            )
        } else {
            let weights = existing(self.t5.clone(), "T5 weights")?;
            let config = weights.with_file_name("config.json");
            (vec![weights], existing(config, "T5 config")?)
        };

        let tokenizer = if self.tokenizer.is_dir() {
            existing(self.tokenizer.join("tokenizer.json"), "T5 tokenizer")?
        } else {
            existing(self.tokenizer.clone(), "T5 tokenizer")?
        };

        let vae = if self.vae.is_dir() {
            let named = self.vae.join(VAE_FILE);
            if named.exists() {
                named
            } else {
                safetensors_in(&self.vae)?.remove(0)
            }
        } else {
            existing(self.vae.clone(), "autoencoder weights")?
        };

        Ok(ModelFiles {
            flow,
            t5_weights,
            t5_config,
            tokenizer,
            vae,
        })
    }

    /// Fetch the artifacts from the Hugging Face Hub, reusing the local cache.
    ///
    /// The flow checkpoint is looked up by the file name of `self.chroma`.
    pub async fn download(&self, api: &Api) -> Result<ModelFiles> {
        let flow_file = self
            .chroma
            .file_name()
            .and_then(|n| n.to_str())
            .context("flow checkpoint path has no file name")?;
        info!("Fetching {flow_file} from {CHROMA_REPO}");
        let flow = api
            .model(CHROMA_REPO.to_string())
            .get(flow_file)
            .await
            .context("failed to get flow checkpoint")?;

        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            T5_REPO.to_string(),
            hf_hub::RepoType::Model,
            T5_REVISION.to_string(),
        ));
        let t5_weights = t5_repo
            .get("model.safetensors")
            .await
            .context("failed to get T5 model file")?;
        let t5_config = t5_repo
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let tokenizer = api
            .model(T5_TOKENIZER_REPO.to_string())
            .get(T5_TOKENIZER_FILE)
            .await
            .context("failed to get T5 tokenizer")?;
        let vae = api
            .model(VAE_REPO.to_string())
            .get(VAE_FILE)
            .await
            .context("failed to get autoencoder model file")?;

        Ok(ModelFiles {
            flow,
            t5_weights: vec![t5_weights],
            t5_config,
            tokenizer,
            vae,
        })
    }
}

/// Names of the tensors stored in a `.safetensors` or `.gguf` checkpoint, read from its
/// header only.
pub fn checkpoint_tensor_names(path: &Path) -> Result<Vec<String>> {
    if path.extension().is_some_and(|ext| ext == "gguf") {
        let mut file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let content = gguf_file::Content::read(&mut file)
            .with_context(|| format!("failed to read gguf header of {}", path.display()))?;
        return Ok(content.tensor_infos.into_keys().collect());
    }

    let tensors = unsafe { MmapedSafetensors::new(path) }
        .with_context(|| format!("failed to read safetensors header of {}", path.display()))?;
    Ok(tensors.tensors().into_iter().map(|(name, _)| name).collect())
}

/// Flux flow network configurations a checkpoint can be loaded as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowVariant {
    /// Embeds a distilled guidance scale.
    Dev,
    Schnell,
}

/// Pick the flow configuration from the checkpoint header.
///
/// Chroma-layout checkpoints are rejected: the Flux flow model needs the modulation weights
/// they drop.
pub fn flow_variant(path: &Path) -> Result<FlowVariant> {
    let names = checkpoint_tensor_names(path)?;
    if names.iter().any(|n| n.starts_with(CHROMA_GUIDANCE_PREFIX)) {
        bail!(
            "{} is a Chroma-layout checkpoint ({CHROMA_GUIDANCE_PREFIX}* tensors), which is not \
             supported by this flow model; pass a Flux-layout checkpoint with --chroma-path",
            path.display()
        );
    }
    if names.iter().any(|n| n == GUIDANCE_TENSOR) {
        Ok(FlowVariant::Dev)
    } else {
        Ok(FlowVariant::Schnell)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_safetensors_header(path: &Path, names: &[&str]) {
        let mut header = serde_json::Map::new();
        header.insert("__metadata__".into(), serde_json::json!({"format": "pt"}));
        for (i, name) in names.iter().enumerate() {
            header.insert(
                name.to_string(),
                serde_json::json!({"dtype": "F32", "shape": [1], "data_offsets": [4 * i, 4 * (i + 1)]}),
            );
        }
        let header = serde_json::to_vec(&header).unwrap();
        let mut file = File::create(path).unwrap();
        file.write_all(&(header.len() as u64).to_le_bytes()).unwrap();
        file.write_all(&header).unwrap();
        file.write_all(&vec![0u8; 4 * names.len()]).unwrap();
    }

    #[test]
    fn reads_safetensors_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.safetensors");
        write_safetensors_header(&path, &["img_in.weight", "guidance_in.in_layer.weight"]);
        let mut names = checkpoint_tensor_names(&path).unwrap();
        names.sort();
        assert_eq!(names, ["guidance_in.in_layer.weight", "img_in.weight"]);
    }

    #[test]
    fn corrupt_header_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.safetensors");
        let mut file = File::create(&path).unwrap();
        file.write_all(&u64::MAX.to_le_bytes()).unwrap();
        file.write_all(b"{}").unwrap();
        drop(file);

        let err = checkpoint_tensor_names(&path).unwrap_err();
        assert!(err.to_string().contains("failed to read safetensors header"));
    }

    #[test]
    fn flow_variant_from_header() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("dev.safetensors");
        write_safetensors_header(&dev, &["img_in.weight", "guidance_in.in_layer.weight"]);
        assert_eq!(flow_variant(&dev).unwrap(), FlowVariant::Dev);

        let schnell = dir.path().join("schnell.safetensors");
        write_safetensors_header(&schnell, &["img_in.weight", "vector_in.in_layer.weight"]);
        assert_eq!(flow_variant(&schnell).unwrap(), FlowVariant::Schnell);
    }

    #[test]
    fn chroma_layout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chroma.safetensors");
        write_safetensors_header(
            &path,
            &["img_in.weight", "distilled_guidance_layer.in_proj.weight"],
        );
        let err = flow_variant(&path).unwrap_err();
        assert!(err.to_string().contains("Chroma-layout checkpoint"));
    }

    #[test]
    fn locates_directory_layouts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for sub in ["t5", "tok", "vae"] {
            std::fs::create_dir(root.join(sub)).unwrap();
        }
        for file in [
            "flow.safetensors",
            "t5/model-00002-of-00002.safetensors",
            "t5/model-00001-of-00002.safetensors",
            "t5/config.json",
            "tok/tokenizer.json",
            "vae/ae.safetensors",
        ] {
            File::create(root.join(file)).unwrap();
        }
        let paths = ModelPaths {
            chroma: root.join("flow.safetensors"),
            t5: root.join("t5"),
            tokenizer: root.join("tok"),
            vae: root.join("vae"),
        };
        let files = paths.locate().unwrap();
        assert_eq!(
            files.t5_weights,
            [
                root.join("t5/model-00001-of-00002.safetensors"),
                root.join("t5/model-00002-of-00002.safetensors")
            ]
        );
        assert_eq!(files.t5_config, root.join("t5/config.json"));
        assert_eq!(files.tokenizer, root.join("tok/tokenizer.json"));
        assert_eq!(files.vae, root.join("vae/ae.safetensors"));
    }

    #[test]
    fn missing_artifacts_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ModelPaths {
            chroma: dir.path().join("missing.safetensors"),
            ..ModelPaths::default()
        };
        let err = paths.locate().unwrap_err();
        assert!(err.to_string().contains("flow checkpoint not found"));
    }
}
