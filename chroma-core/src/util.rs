use candle_core::Tensor;
use image::DynamicImage;
use indicatif::{ProgressBar, ProgressStyle};

use crate::Error;

/// Converts a `u8` tensor with shape (height, width, channels) into an image.
pub fn tensor_to_image(img: &Tensor) -> crate::Result<DynamicImage> {
    let (height, width, channels) = img.dims3()?;
    let pixels = img.flatten_all()?.to_vec1::<u8>()?;
    let (width, height) = (width as u32, height as u32);
    let image = match channels {
        1 => image::GrayImage::from_raw(width, height, pixels).map(DynamicImage::ImageLuma8),
        3 => image::RgbImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgb8),
        4 => image::RgbaImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgba8),
        other => return Err(Error::UnsupportedChannels(other)),
    };
    image.ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer").into())
}

/// Progress bar for a loop of `len` iterations, or a hidden one.
pub(crate) fn progress_bar(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} [{elapsed_precise}<{eta_precise}] {msg}")
    {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn converts_rgb_and_gray() {
        let rgb = Tensor::zeros((2, 3, 3), candle_core::DType::U8, &Device::Cpu).unwrap();
        let img = tensor_to_image(&rgb).unwrap();
        assert_eq!((img.width(), img.height()), (3, 2));
        assert!(matches!(img, DynamicImage::ImageRgb8(_)));

        let gray = Tensor::zeros((2, 3, 1), candle_core::DType::U8, &Device::Cpu).unwrap();
        assert!(matches!(
            tensor_to_image(&gray).unwrap(),
            DynamicImage::ImageLuma8(_)
        ));
    }

    #[test]
    fn rejects_odd_channel_counts() {
        let img = Tensor::zeros((2, 2, 2), candle_core::DType::U8, &Device::Cpu).unwrap();
        assert!(matches!(
            tensor_to_image(&img),
            Err(Error::UnsupportedChannels(2))
        ));
    }
}
