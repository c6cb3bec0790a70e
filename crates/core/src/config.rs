use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;
use crate::engine::{PrecisionMode, UpscaleRequest};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TILESCALE_DATA_DIR";

pub const SUPPORTED_OUTPUT_FORMATS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "tiff"];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub upscale: UpscaleConfig,
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub output_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpscaleConfig {
    pub default_scale: u32,
    pub default_format: String,
    pub jpeg_quality: u8,
    pub tile_size: u32,
    pub tile_overlap: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PerformanceConfig {
    pub fp16: bool,
    pub max_loaded_models: usize,
    /// `cuda` or `tensorrt`.
    pub backend: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            output_dir: PathBuf::from("output"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            default_scale: 4,
            default_format: "png".to_string(),
            jpeg_quality: 95,
            tile_size: 512,
            tile_overlap: 32,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            fp16: true,
            max_loaded_models: 3,
            backend: "cuda".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Resolve paths against `data_dir` and check value ranges.
    pub fn settings(&self, data_dir: &Path) -> Result<UpscaleSettings> {
        let upscale = &self.upscale;
        if upscale.default_scale == 0 {
            bail!("upscale.default_scale must be at least 1");
        }
        if upscale.tile_size == 0 {
            bail!("upscale.tile_size must be greater than 0");
        }
        if upscale.tile_overlap >= upscale.tile_size {
            bail!(
                "upscale.tile_overlap ({}) must be smaller than upscale.tile_size ({})",
                upscale.tile_overlap,
                upscale.tile_size
            );
        }
        if !(1..=100).contains(&upscale.jpeg_quality) {
            bail!("upscale.jpeg_quality must be in 1..=100, got {}", upscale.jpeg_quality);
        }
        let format = upscale.default_format.trim().to_ascii_lowercase();
        if !SUPPORTED_OUTPUT_FORMATS.contains(&format.as_str()) {
            bail!("unsupported upscale.default_format: {}", upscale.default_format);
        }
        if self.performance.max_loaded_models == 0 {
            bail!("performance.max_loaded_models must be at least 1");
        }
        let Some(backend) = InferenceBackend::parse(&self.performance.backend) else {
            bail!("unsupported performance.backend: {}", self.performance.backend);
        };

        Ok(UpscaleSettings {
            models_dir: resolve_relative_to(data_dir, &self.paths.models_dir),
            output_dir: resolve_relative_to(data_dir, &self.paths.output_dir),
            trt_cache_dir: resolve_relative_to(data_dir, &self.paths.trt_cache_dir),
            scale: upscale.default_scale,
            format,
            jpeg_quality: upscale.jpeg_quality,
            tile_size: upscale.tile_size,
            tile_overlap: upscale.tile_overlap,
            fp16: self.performance.fp16,
            max_loaded_models: self.performance.max_loaded_models,
            backend,
        })
    }
}

/// Validated runtime settings with absolute-or-data-dir-relative paths.
///
/// Built once at startup and passed explicitly to whatever needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpscaleSettings {
    pub models_dir: PathBuf,
    pub output_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
    pub scale: u32,
    pub format: String,
    pub jpeg_quality: u8,
    pub tile_size: u32,
    pub tile_overlap: u32,
    pub fp16: bool,
    pub max_loaded_models: usize,
    pub backend: InferenceBackend,
}

impl UpscaleSettings {
    pub fn request(&self, model_id: &str) -> UpscaleRequest {
        UpscaleRequest {
            model_id: model_id.to_string(),
            target_scale: self.scale,
            tile_size: self.tile_size,
            overlap: self.tile_overlap,
            precision: if self.fp16 {
                PrecisionMode::Auto
            } else {
                PrecisionMode::Full
            },
        }
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TILESCALE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create `data_dir` and write a default config.toml if none exists yet.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
