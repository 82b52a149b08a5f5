use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by the generation orchestrator itself.
///
/// Model-loading failures are reported through `anyhow` by the loaders; everything the
/// orchestration loop can detect on its own has a variant here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid image size `{0}`, expected WIDTHxHEIGHT with two positive integers")]
    InvalidImageSize(String),

    #[error("{what} must be positive")]
    NotPositive { what: &'static str },

    #[error("cannot arrange {n_images} images into {n_rows} rows")]
    GridShape { n_images: usize, n_rows: usize },

    #[error("latent sequence ended after {pulled} items, expected {expected}")]
    SequenceExhausted { pulled: usize, expected: usize },

    #[error("latent sequence still has items after the expected {expected} pulls")]
    SequenceOverrun { expected: usize },

    #[error("cannot save an image with {0} channels")]
    UnsupportedChannels(usize),

    #[error("output path `{0}` has no file extension")]
    MissingExtension(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
