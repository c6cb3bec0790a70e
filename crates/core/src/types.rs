use half::f16;
use ndarray::{s, Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpscaleError};

pub const CHANNELS: usize = 3;

/// Numeric precision an image buffer or model handle runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Full,
    /// Values are restricted to what `f16` can represent.
    Reduced,
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "fp32"),
            Self::Reduced => write!(f, "fp16"),
        }
    }
}

/// Dense RGB image, channel-major (`3 x H x W`), values normalized to `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    data: Array3<f32>,
    precision: Precision,
}

impl Image {
    pub fn new(data: Array3<f32>, precision: Precision) -> Result<Self> {
        let (channels, height, width) = data.dim();
        if channels != CHANNELS {
            return Err(UpscaleError::DimensionMismatch(format!(
                "expected {CHANNELS} channels, got {channels}"
            )));
        }
        if height == 0 || width == 0 {
            return Err(UpscaleError::DimensionMismatch(format!(
                "image must not be empty ({width}x{height})"
            )));
        }
        let mut image = Self { data, precision };
        if precision == Precision::Reduced {
            quantize_to_half(&mut image.data);
        }
        Ok(image)
    }

    pub fn filled(width: u32, height: u32, value: f32) -> Result<Self> {
        Self::new(
            Array3::from_elem((CHANNELS, height as usize, width as usize), value),
            Precision::Full,
        )
    }

    /// Build from interleaved 8-bit RGB (`[r, g, b, r, g, b, ...]`).
    pub fn from_rgb8(width: u32, height: u32, rgb: &[u8]) -> Result<Self> {
        let (w, h) = (width as usize, height as usize);
        if rgb.len() != w * h * CHANNELS {
            return Err(UpscaleError::DimensionMismatch(format!(
                "RGB buffer has {} bytes, expected {} for {width}x{height}",
                rgb.len(),
                w * h * CHANNELS
            )));
        }
        let data = Array3::from_shape_fn((CHANNELS, h, w), |(c, y, x)| {
            rgb[(y * w + x) * CHANNELS + c] as f32 / 255.0
        });
        Self::new(data, Precision::Full)
    }

    /// Build from interleaved f32 RGB in `[0, 1]`.
    pub fn from_rgb32f(width: u32, height: u32, rgb: &[f32]) -> Result<Self> {
        let (w, h) = (width as usize, height as usize);
        if rgb.len() != w * h * CHANNELS {
            return Err(UpscaleError::DimensionMismatch(format!(
                "RGB buffer has {} samples, expected {} for {width}x{height}",
                rgb.len(),
                w * h * CHANNELS
            )));
        }
        let data = Array3::from_shape_fn((CHANNELS, h, w), |(c, y, x)| {
            rgb[(y * w + x) * CHANNELS + c]
        });
        Self::new(data, Precision::Full)
    }

    pub fn width(&self) -> u32 {
        self.data.dim().2 as u32
    }

    pub fn height(&self) -> u32 {
        self.data.dim().1 as u32
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    pub fn into_data(self) -> Array3<f32> {
        self.data
    }

    /// Copy of the image in the requested precision.
    pub fn to_precision(&self, precision: Precision) -> Self {
        let mut data = self.data.clone();
        if precision == Precision::Reduced && self.precision == Precision::Full {
            quantize_to_half(&mut data);
        }
        Self { data, precision }
    }

    /// Owned copy of a sub-rectangle. Caller guarantees the rectangle is in bounds.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Self {
        let (x, y) = (x as usize, y as usize);
        let (w, h) = (width as usize, height as usize);
        Self {
            data: self.data.slice(s![.., y..y + h, x..x + w]).to_owned(),
            precision: self.precision,
        }
    }

    pub fn clamp_unit(&mut self) {
        self.data.mapv_inplace(|v| v.clamp(0.0, 1.0));
    }

    /// Interleaved 8-bit RGB, clamped and rounded.
    pub fn to_rgb8(&self) -> Vec<u8> {
        let (_, h, w) = self.data.dim();
        let mut rgb = Vec::with_capacity(w * h * CHANNELS);
        for y in 0..h {
            for x in 0..w {
                for c in 0..CHANNELS {
                    let v = self.data[[c, y, x]];
                    rgb.push((v * 255.0).round().clamp(0.0, 255.0) as u8);
                }
            }
        }
        rgb
    }

    /// Interleaved f32 RGB.
    pub fn to_rgb32f(&self) -> Vec<f32> {
        let (_, h, w) = self.data.dim();
        let mut rgb = Vec::with_capacity(w * h * CHANNELS);
        for y in 0..h {
            for x in 0..w {
                for c in 0..CHANNELS {
                    rgb.push(self.data[[c, y, x]]);
                }
            }
        }
        rgb
    }
}

pub(crate) fn quantize_to_half(data: &mut Array3<f32>) {
    data.mapv_inplace(|v| f16::from_f32(v).to_f32());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_channel_count() {
        let err = Image::new(Array3::zeros((4, 2, 2)), Precision::Full).unwrap_err();
        assert!(err.to_string().contains("expected 3 channels"));
    }

    #[test]
    fn rejects_empty() {
        assert!(Image::new(Array3::zeros((3, 0, 5)), Precision::Full).is_err());
    }

    #[test]
    fn rgb8_layout_is_channel_major() {
        let rgb = vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 128, 128, 128];
        let image = Image::from_rgb8(2, 2, &rgb).unwrap();
        assert_eq!(image.width(), 2);
        assert_eq!(image.height(), 2);
        assert_eq!(image.data()[[0, 0, 0]], 1.0);
        assert_eq!(image.data()[[1, 0, 1]], 1.0);
        assert_eq!(image.data()[[2, 1, 0]], 1.0);
        assert_eq!(image.to_rgb8(), rgb);
    }

    #[test]
    fn rgb8_length_mismatch() {
        assert!(Image::from_rgb8(2, 2, &[0u8; 11]).is_err());
    }

    #[test]
    fn reduced_precision_quantizes_values() {
        let value = 0.1f32;
        let image = Image::filled(2, 2, value).unwrap();
        let reduced = image.to_precision(Precision::Reduced);
        assert_eq!(reduced.precision(), Precision::Reduced);
        let expected = f16::from_f32(value).to_f32();
        assert_eq!(reduced.data()[[0, 0, 0]], expected);
        assert_ne!(expected, value);
    }

    #[test]
    fn crop_copies_region() {
        let data = Array3::from_shape_fn((3, 4, 4), |(c, y, x)| (c * 100 + y * 10 + x) as f32);
        let image = Image::new(data, Precision::Full).unwrap();
        let tile = image.crop(1, 2, 3, 2);
        assert_eq!(tile.width(), 3);
        assert_eq!(tile.height(), 2);
        assert_eq!(tile.data()[[0, 0, 0]], 21.0);
        assert_eq!(tile.data()[[2, 1, 2]], 233.0);
    }

    #[test]
    fn precision_display() {
        assert_eq!(Precision::Full.to_string(), "fp32");
        assert_eq!(Precision::Reduced.to_string(), "fp16");
    }
}
