use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use tracing::info;

use crate::{tensor_to_image, Error, Result};

/// Zero border added around every image in grid mode, on each side.
pub const GRID_PADDING: usize = 4;

/// How the decoded batch ends up on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// One file per image, named `<stem>.<index>.<ext>`.
    Raw,
    /// All images tiled into a single file.
    Grid { n_rows: usize },
}

impl OutputMode {
    /// Reject layouts and output paths that cannot be written before any work is spent on
    /// them.
    pub fn validate(&self, n_images: usize, output: &Path) -> Result<()> {
        match *self {
            Self::Raw => raw_file_names(output, n_images).map(|_| ()),
            Self::Grid { n_rows } => grid_columns(n_images, n_rows).map(|_| ()),
        }
    }
}

fn grid_columns(n_images: usize, n_rows: usize) -> Result<usize> {
    if n_rows == 0 || n_images % n_rows != 0 {
        return Err(Error::GridShape { n_images, n_rows });
    }
    Ok(n_images / n_rows)
}

/// File names for raw mode: the zero-based index goes before the extension.
pub fn raw_file_names(output: &Path, n_images: usize) -> Result<Vec<PathBuf>> {
    let missing = || Error::MissingExtension(output.display().to_string());
    let stem = output.file_stem().ok_or_else(missing)?.to_string_lossy();
    let ext = output.extension().ok_or_else(missing)?.to_string_lossy();
    Ok((0..n_images)
        .map(|i| output.with_file_name(format!("{stem}.{i}.{ext}")))
        .collect())
}

/// Map `[0, 1]` floats to `u8` by scaling with 255 and truncating.
pub fn quantize(images: &Tensor) -> Result<Tensor> {
    Ok(images
        .to_dtype(DType::F32)?
        .affine(255.0, 0.0)?
        .to_dtype(DType::U8)?)
}

/// Tile a `(B, H, W, C)` batch into one `(rows·(H+8), cols·(W+8), C)` image.
///
/// Output pixel `(r·(H+8) + y, c·(W+8) + x)` is pixel `(y, x)` of the padded image
/// `r·cols + c`, i.e. images fill the grid row by row.
pub fn tile_grid(images: &Tensor, n_rows: usize) -> Result<Tensor> {
    let (b, _, _, _) = images.dims4()?;
    let cols = grid_columns(b, n_rows)?;
    let padded = images
        .pad_with_zeros(1, GRID_PADDING, GRID_PADDING)?
        .pad_with_zeros(2, GRID_PADDING, GRID_PADDING)?;
    let (_, h, w, c) = padded.dims4()?;
    Ok(padded
        .reshape((n_rows, cols, h, w, c))?
        .permute((0, 2, 1, 3, 4))?
        .reshape((n_rows * h, cols * w, c))?)
}

/// Write the decoded sub-batches to disk and return the paths written.
pub fn save_images(decoded: &[Tensor], mode: OutputMode, output: &Path) -> Result<Vec<PathBuf>> {
    let images = Tensor::cat(decoded, 0)?;
    let n_images = images.dim(0)?;
    match mode {
        OutputMode::Raw => {
            let names = raw_file_names(output, n_images)?;
            let images = quantize(&images)?;
            for (i, name) in names.iter().enumerate() {
                tensor_to_image(&images.get(i)?)?.save(name)?;
                info!("Saved {}", name.display());
            }
            Ok(names)
        }
        OutputMode::Grid { n_rows } => {
            let grid = quantize(&tile_grid(&images, n_rows)?)?;
            tensor_to_image(&grid)?.save(output)?;
            info!("Saved {}", output.display());
            Ok(vec![output.to_path_buf()])
        }
    }
}
