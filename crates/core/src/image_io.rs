use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, DynamicImage, ImageFormat, RgbImage};
use tracing::{debug, warn};

use crate::types::Image;

/// File extensions accepted as upscale inputs (lowercase, without the dot).
pub const SUPPORTED_INPUT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "tiff", "tif"];

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_INPUT_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Extension (with dot) for an output format name; unknown formats map to `.png`.
pub fn format_to_ext(format: &str) -> &'static str {
    match format.trim().to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => ".jpg",
        "webp" => ".webp",
        "bmp" => ".bmp",
        "tiff" | "tif" => ".tiff",
        _ => ".png",
    }
}

/// `<stem>_<scale>x_<model><ext>`
pub fn default_output_name(input: &Path, scale: u32, model_id: &str, format: &str) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    format!("{stem}_{scale}x_{model_id}{}", format_to_ext(format))
}

/// Decode an image file into a full-precision RGB [`Image`]. Alpha is dropped.
pub fn load_image(path: &Path) -> Result<Image> {
    if !is_supported_image(path) {
        bail!("Unsupported image format: {}", path.display());
    }
    let decoded =
        image::open(path).with_context(|| format!("Failed to decode image: {}", path.display()))?;
    if decoded.color().has_alpha() {
        warn!(path = %path.display(), "Image has an alpha channel, stripping alpha");
    }

    let rgb = decoded.to_rgb32f();
    let (width, height) = rgb.dimensions();
    debug!(path = %path.display(), width, height, "Loaded image");
    Ok(Image::from_rgb32f(width, height, rgb.as_raw())?)
}

/// Encode `image` to `path`, creating parent directories as needed.
///
/// `quality` applies to JPEG only; WebP is written lossless.
pub fn save_image(image: &Image, path: &Path, format: &str, quality: u8) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }

    let (width, height) = (image.width(), image.height());
    let pixels = image.to_rgb8();
    let format_name = format.trim().to_ascii_lowercase();

    match format_name.as_str() {
        "jpg" | "jpeg" => {
            let buffer = RgbImage::from_raw(width, height, pixels)
                .context("RGB buffer does not match image dimensions")?;
            let file = File::create(path)
                .with_context(|| format!("Failed to create file: {}", path.display()))?;
            let encoder = JpegEncoder::new_with_quality(BufWriter::new(file), quality.clamp(1, 100));
            DynamicImage::ImageRgb8(buffer)
                .write_with_encoder(encoder)
                .with_context(|| format!("Failed to encode JPEG: {}", path.display()))?;
        }
        other => {
            let format = match other {
                "png" => ImageFormat::Png,
                "webp" => ImageFormat::WebP,
                "bmp" => ImageFormat::Bmp,
                "tiff" | "tif" => ImageFormat::Tiff,
                _ => bail!("Unsupported output format: {format}"),
            };
            image::save_buffer_with_format(path, &pixels, width, height, ColorType::Rgb8, format)
                .with_context(|| format!("Failed to write image: {}", path.display()))?;
        }
    }

    debug!(path = %path.display(), width, height, format = %format_name, "Saved image");
    Ok(())
}
