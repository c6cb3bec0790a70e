use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    /// Stable id used on the command line and in the cache.
    pub name: String,
    pub display_name: String,
    pub filename: String,
    pub architecture: String,
    /// Native upscale factor. `None` for discovered files whose name carries no scale marker.
    pub scale: Option<u32>,
    /// Value range the model expects/produces: `(0.0, 1.0)` for ESRGAN exports, `(0.0, 255.0)` for some community exports.
    pub normalization_range: (f32, f32),
    /// Spatial dimensions are padded to a multiple of this before inference.
    pub pad_align: u32,
    pub description: String,
}

fn builtin_catalog() -> Vec<ModelEntry> {
    vec![
        ModelEntry {
            name: "RealESRGAN_x4plus".into(),
            display_name: "Real-ESRGAN x4+".into(),
            filename: "RealESRGAN_x4plus.onnx".into(),
            architecture: "Real-ESRGAN".into(),
            scale: Some(4),
            normalization_range: (0.0, 1.0),
            pad_align: 4,
            description: "General purpose 4x photo model".into(),
        },
        ModelEntry {
            name: "RealESRGAN_x2plus".into(),
            display_name: "Real-ESRGAN x2+".into(),
            filename: "RealESRGAN_x2plus.onnx".into(),
            architecture: "Real-ESRGAN".into(),
            scale: Some(2),
            normalization_range: (0.0, 1.0),
            pad_align: 4,
            description: "General purpose 2x photo model".into(),
        },
        ModelEntry {
            name: "RealESRGAN_x4plus_anime_6B".into(),
            display_name: "Real-ESRGAN x4+ Anime 6B".into(),
            filename: "RealESRGAN_x4plus_anime_6B.onnx".into(),
            architecture: "Real-ESRGAN".into(),
            scale: Some(4),
            normalization_range: (0.0, 1.0),
            pad_align: 4,
            description: "4x anime illustration model (6-block variant)".into(),
        },
        ModelEntry {
            name: "4xNomos8kDAT".into(),
            display_name: "4x Nomos8k DAT".into(),
            filename: "4xNomos8kDAT.onnx".into(),
            architecture: "DAT".into(),
            scale: Some(4),
            normalization_range: (0.0, 1.0),
            pad_align: 16,
            description: "4x transformer model trained on Nomos8k photos".into(),
        },
    ]
}

/// Infer the native scale from `x4` / `4x` style markers in a model file name.
///
/// A marker must start the name or follow a non-alphanumeric character, so
/// `RealESRGAN_x2plus` and `4xNomos8kDAT` match while `max2` does not.
pub fn parse_scale_marker(name: &str) -> Option<u32> {
    let bytes = name.as_bytes();
    let at_boundary = |i: usize| i == 0 || !bytes[i - 1].is_ascii_alphanumeric();
    let digits_from = |start: usize| {
        let end = bytes[start..]
            .iter()
            .position(|b| !b.is_ascii_digit())
            .map_or(bytes.len(), |offset| start + offset);
        (end > start).then(|| (name[start..end].parse::<u32>().ok(), end))
    };

    let mut i = 0;
    while i < bytes.len() {
        if !at_boundary(i) {
            i += 1;
            continue;
        }
        let scale = if bytes[i].eq_ignore_ascii_case(&b'x') {
            digits_from(i + 1).and_then(|(value, _)| value)
        } else if bytes[i].is_ascii_digit() {
            digits_from(i).and_then(|(value, end)| {
                (end < bytes.len() && bytes[end].eq_ignore_ascii_case(&b'x'))
                    .then_some(value)
                    .flatten()
            })
        } else {
            None
        };
        if let Some(scale) = scale.filter(|s| (1..=16).contains(s)) {
            return Some(scale);
        }
        i += 1;
    }
    None
}

pub struct ModelRegistry {
    models_dir: PathBuf,
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: Vec::new(),
        }
    }

    pub fn with_builtin_models(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: builtin_catalog(),
        }
    }

    pub fn models_dir(&self) -> &std::path::Path {
        &self.models_dir
    }

    /// Register `*.onnx` files in the models directory that the catalog does not know.
    pub fn discover(&mut self) -> Result<usize> {
        let dir = &self.models_dir;
        if !dir.exists() {
            return Ok(0);
        }

        let read_dir = fs::read_dir(dir)
            .with_context(|| format!("Failed to read models directory: {}", dir.display()))?;

        let mut paths: Vec<PathBuf> = read_dir
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"))
            })
            .collect();
        paths.sort();

        let mut added = 0;
        for path in paths {
            let (Some(filename), Some(stem)) = (
                path.file_name().and_then(|n| n.to_str()),
                path.file_stem().and_then(|s| s.to_str()),
            ) else {
                continue;
            };

            if self.entries.iter().any(|e| e.filename == filename) {
                continue;
            }

            let scale = parse_scale_marker(stem);
            info!(filename = %filename, scale = ?scale, "Discovered ONNX model");

            self.entries.push(ModelEntry {
                name: stem.to_string(),
                display_name: stem.to_string(),
                filename: filename.to_string(),
                architecture: "unknown".into(),
                scale,
                normalization_range: (0.0, 1.0),
                pad_align: 4,
                description: "Discovered model (metadata unknown)".into(),
            });
            added += 1;
        }

        debug!(added, total = self.entries.len(), "Model discovery finished");
        Ok(added)
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn is_downloaded(&self, name: &str) -> bool {
        self.model_path(name).is_some_and(|path| path.is_file())
    }

    pub fn model_path(&self, name: &str) -> Option<PathBuf> {
        self.get(name).map(|e| self.models_dir.join(&e.filename))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries).context("Failed to serialize model catalog")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_models_dir() -> PathBuf {
        std::env::temp_dir().join("tilescale-models")
    }

    #[test]
    fn test_builtin_catalog() {
        let reg = ModelRegistry::with_builtin_models(test_models_dir());
        assert_eq!(reg.list().len(), 4);
        assert!(reg.list().iter().all(|e| e.scale.is_some()));

        let x2 = reg.get("RealESRGAN_x2plus").unwrap();
        assert_eq!(x2.scale, Some(2));
        assert_eq!(x2.filename, "RealESRGAN_x2plus.onnx");

        let dat = reg.get("4xNomos8kDAT").unwrap();
        assert_eq!(dat.architecture, "DAT");
        assert_eq!(dat.pad_align, 16);
    }

    #[test]
    fn test_get_missing() {
        let reg = ModelRegistry::with_builtin_models(test_models_dir());
        assert!(reg.get("NonExistentModel").is_none());
        assert!(reg.model_path("NonExistentModel").is_none());
    }

    #[test]
    fn test_model_path() {
        let reg = ModelRegistry::with_builtin_models(test_models_dir());
        assert_eq!(
            reg.model_path("RealESRGAN_x4plus"),
            Some(test_models_dir().join("RealESRGAN_x4plus.onnx"))
        );
    }

    #[test]
    fn test_is_downloaded() {
        let dir = tempdir().unwrap();
        let reg = ModelRegistry::with_builtin_models(dir.path().to_path_buf());
        assert!(!reg.is_downloaded("RealESRGAN_x4plus"));
        assert!(!reg.is_downloaded("not-registered"));

        fs::write(dir.path().join("RealESRGAN_x4plus.onnx"), b"fake").unwrap();
        assert!(reg.is_downloaded("RealESRGAN_x4plus"));
        assert!(!reg.is_downloaded("RealESRGAN_x2plus"));
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let mut reg = ModelRegistry::with_builtin_models(PathBuf::from("/nonexistent/tilescale"));
        assert_eq!(reg.discover().unwrap(), 0);
        assert_eq!(reg.list().len(), 4);
    }

    #[test]
    fn test_discover_known_and_unknown_models() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("RealESRGAN_x4plus.onnx"), b"data").unwrap();
        fs::write(dir.path().join("4x_Custom_Photo.onnx"), b"data").unwrap();
        fs::write(dir.path().join("mystery.onnx"), b"data").unwrap();
        fs::write(dir.path().join("readme.txt"), b"hello").unwrap();

        let mut reg = ModelRegistry::with_builtin_models(dir.path().to_path_buf());
        assert_eq!(reg.discover().unwrap(), 2);
        assert_eq!(reg.list().len(), 6);

        let custom = reg.get("4x_Custom_Photo").unwrap();
        assert_eq!(custom.scale, Some(4));
        assert_eq!(custom.filename, "4x_Custom_Photo.onnx");
        assert_eq!(reg.get("mystery").unwrap().scale, None);
        assert!(reg.is_downloaded("mystery"));
    }

    #[test]
    fn test_parse_scale_marker() {
        assert_eq!(parse_scale_marker("RealESRGAN_x4plus"), Some(4));
        assert_eq!(parse_scale_marker("RealESRGAN_x2plus"), Some(2));
        assert_eq!(parse_scale_marker("4xNomos8kDAT"), Some(4));
        assert_eq!(parse_scale_marker("AnimeJaNai_fp16_X2"), Some(2));
        assert_eq!(parse_scale_marker("model-3x-sharp"), Some(3));
        assert_eq!(parse_scale_marker("max2"), None);
        assert_eq!(parse_scale_marker("nomos8k"), None);
        assert_eq!(parse_scale_marker("x64_build"), None);
        assert_eq!(parse_scale_marker(""), None);
    }

    #[test]
    fn test_to_json_lists_catalog() {
        let reg = ModelRegistry::with_builtin_models(test_models_dir());
        let json = reg.to_json().unwrap();
        let entries: Vec<ModelEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(
            entries.iter().find(|e| e.name == "RealESRGAN_x4plus"),
            reg.get("RealESRGAN_x4plus")
        );
    }
}
