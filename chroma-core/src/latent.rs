use std::{fmt, str::FromStr};

use tracing::warn;

use crate::{Error, Result};

/// Pixel sizes must be a multiple of this to map onto whole patches of the latent grid.
pub const SIZE_GRANULARITY: usize = 16;

/// Number of pixels covered by one latent unit along each axis.
pub const LATENT_DOWNSCALE: usize = 8;

/// Requested output size in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageSize {
    pub width: usize,
    pub height: usize,
}

impl ImageSize {
    pub fn new(width: usize, height: usize) -> Result<Self> {
        if width == 0 {
            return Err(Error::NotPositive { what: "image width" });
        }
        if height == 0 {
            return Err(Error::NotPositive {
                what: "image height",
            });
        }
        Ok(Self { width, height })
    }

    /// Round both dimensions up to the next multiple of [`SIZE_GRANULARITY`].
    pub fn rounded(&self) -> Self {
        Self {
            width: self.width.div_ceil(SIZE_GRANULARITY) * SIZE_GRANULARITY,
            height: self.height.div_ceil(SIZE_GRANULARITY) * SIZE_GRANULARITY,
        }
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ImageSize {
    type Err = Error;

    /// Parses `WIDTHxHEIGHT`, e.g. `512x768`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidImageSize(s.to_string());
        let (w, h) = s.split_once('x').ok_or_else(invalid)?;
        let width = w.trim().parse::<usize>().map_err(|_| invalid())?;
        let height = h.trim().parse::<usize>().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

/// Size of the latent grid, in latent units. Height comes first, matching the tensor layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LatentSize {
    pub height: usize,
    pub width: usize,
}

impl LatentSize {
    /// Pixel size this latent grid decodes to.
    pub fn image_size(&self) -> ImageSize {
        ImageSize {
            width: self.width * LATENT_DOWNSCALE,
            height: self.height * LATENT_DOWNSCALE,
        }
    }
}

/// Outcome of [`resolve`]: the latent size plus the pixel size actually used, if it had to change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedSize {
    pub latent: LatentSize,
    pub adjusted: Option<ImageSize>,
}

/// Map a requested pixel size to a latent size, rounding up to the size granularity.
///
/// A rounded size is reported once through `tracing::warn!` and returned in
/// [`ResolvedSize::adjusted`]; it is never an error.
pub fn resolve(image_size: ImageSize) -> ResolvedSize {
    let rounded = image_size.rounded();
    let adjusted = (rounded != image_size).then(|| {
        warn!(
            "The image dimensions need to be divisible by {SIZE_GRANULARITY}px. Changing size to {rounded}."
        );
        rounded
    });
    ResolvedSize {
        latent: LatentSize {
            height: rounded.height / LATENT_DOWNSCALE,
            width: rounded.width / LATENT_DOWNSCALE,
        },
        adjusted,
    }
}
