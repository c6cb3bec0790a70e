use image::imageops::{self, FilterType};
use image::Rgb32FImage;

use crate::error::{Result, UpscaleError};
use crate::types::{Image, Precision};

/// Deterministic image resize used to correct a scale mismatch after the last pass.
pub trait Resampler: Send + Sync {
    fn resize(&self, image: &Image, width: u32, height: u32) -> Result<Image>;
}

/// Lanczos3 resampling through the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct LanczosResampler;

impl Resampler for LanczosResampler {
    fn resize(&self, image: &Image, width: u32, height: u32) -> Result<Image> {
        if width == 0 || height == 0 {
            return Err(UpscaleError::Resample(format!(
                "target size must be non-zero, got {width}x{height}"
            )));
        }

        let buffer = Rgb32FImage::from_raw(image.width(), image.height(), image.to_rgb32f())
            .ok_or_else(|| {
                UpscaleError::Resample(format!(
                    "failed to wrap {}x{} buffer",
                    image.width(),
                    image.height()
                ))
            })?;
        let resized = imageops::resize(&buffer, width, height, FilterType::Lanczos3);
        let output = Image::from_rgb32f(width, height, resized.as_raw())?;

        Ok(match image.precision() {
            Precision::Full => output,
            Precision::Reduced => output.to_precision(Precision::Reduced),
        })
    }
}
