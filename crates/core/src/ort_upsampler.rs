//! ONNX Runtime implementation of [`Upsampler`] and [`ModelLoader`].
//!
//! Tiles are converted to NCHW, scaled into the model's value range, and
//! reflect-padded to the model's alignment. fp16-input models get `f16`
//! tensors. The padded border is cropped from the output before it is mapped
//! back to `[0, 1]`.

use std::path::PathBuf;

use half::{f16, slice::HalfFloatSliceExt};
use ndarray::{s, Array3, Array4, ArrayD, ArrayView3, Axis, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::{debug, info};

use crate::backend::{build_session, InferenceBackend, SessionConfig};
use crate::error::{Result, UpscaleError};
use crate::model_registry::{ModelEntry, ModelRegistry};
use crate::types::{Image, Precision, CHANNELS};
use crate::upsampler::{ModelLoader, Upsampler};

const OOM_MARKERS: &[&str] = &[
    "out of memory",
    "failed to allocate memory",
    "cudaerrormemoryallocation",
    "cuda_error_out_of_memory",
    "bfcarena",
];

const HALF_KERNEL_MARKERS: &[&str] = &["float16", "fp16", "(tensor(half))"];

/// Sort an ONNX Runtime failure into the engine's recoverable categories.
///
/// `precision` is the precision the session was running in; a missing half
/// kernel is only a precision problem when the model ran reduced.
pub(crate) fn classify_inference_error(
    message: &str,
    tile_size: u32,
    precision: Precision,
) -> UpscaleError {
    let lower = message.to_ascii_lowercase();
    if OOM_MARKERS.iter().any(|m| lower.contains(m)) {
        return UpscaleError::exhausted(tile_size, message);
    }
    if precision == Precision::Reduced && HALF_KERNEL_MARKERS.iter().any(|m| lower.contains(m)) {
        return UpscaleError::precision(message);
    }
    UpscaleError::inference(message)
}

/// Symmetric reflection of `i` into `0..n`, for any distance past the edge.
fn mirror_index(i: usize, n: usize) -> usize {
    let period = 2 * n;
    let m = i % period;
    if m < n {
        m
    } else {
        period - 1 - m
    }
}

fn pad_amount(dim: usize, align: usize) -> usize {
    if align <= 1 {
        0
    } else {
        (align - dim % align) % align
    }
}

/// Reflect-pad a `C x H x W` array on the bottom and right so both spatial
/// dimensions are multiples of `align`.
fn reflect_pad(data: ArrayView3<'_, f32>, align: usize) -> Array3<f32> {
    let (channels, h, w) = data.dim();
    let (pad_h, pad_w) = (pad_amount(h, align), pad_amount(w, align));
    if pad_h == 0 && pad_w == 0 {
        return data.to_owned();
    }
    Array3::from_shape_fn((channels, h + pad_h, w + pad_w), |(c, y, x)| {
        data[[c, mirror_index(y, h), mirror_index(x, w)]]
    })
}

fn to_model_range(value: f32, (lo, hi): (f32, f32)) -> f32 {
    value * (hi - lo) + lo
}

fn from_model_range(value: f32, (lo, hi): (f32, f32)) -> f32 {
    (value - lo) / (hi - lo)
}

/// fp16-input models cannot be run in full precision. f32-input models run in
/// full precision even when reduced was requested.
fn check_precision(requested: Precision, effective: Precision) -> std::result::Result<(), String> {
    if requested == Precision::Full && effective != Precision::Full {
        return Err("model only accepts float16 input and cannot run in full precision".to_string());
    }
    Ok(())
}

pub struct OrtUpsampler {
    session: Session,
    input_name: String,
    output_name: String,
    fp16_input: bool,
    scale: u32,
    precision: Precision,
    normalization_range: (f32, f32),
    pad_align: usize,
    f16_staging: Vec<f16>,
}

impl OrtUpsampler {
    /// Wrap a built session. The effective precision is what the model's input
    /// type allows: fp16-input models always run reduced, fp32-input models
    /// always run full.
    pub fn from_session(session: Session, entry: &ModelEntry, scale: u32) -> Self {
        let input_name = session.inputs()[0].name().to_string();
        let output_name = session.outputs()[0].name().to_string();
        let fp16_input = match session.inputs()[0].dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };
        debug!(%input_name, %output_name, fp16_input, "Detected model IO");

        Self {
            session,
            input_name,
            output_name,
            fp16_input,
            scale,
            precision: if fp16_input {
                Precision::Reduced
            } else {
                Precision::Full
            },
            normalization_range: entry.normalization_range,
            pad_align: entry.pad_align.max(1) as usize,
            f16_staging: Vec::new(),
        }
    }

    fn run_f32(&mut self, input: Array4<f32>) -> anyhow::Result<ArrayD<f32>> {
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &tensor])?;
        let view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(view.to_owned())
    }

    fn run_f16(&mut self, input: Array4<f32>) -> anyhow::Result<ArrayD<f32>> {
        let shape = input.shape().to_vec();
        let contiguous = input.as_standard_layout();
        let values = contiguous
            .as_slice()
            .ok_or_else(|| anyhow::anyhow!("input tensor is not contiguous"))?;

        self.f16_staging.clear();
        self.f16_staging.resize(values.len(), f16::ZERO);
        self.f16_staging.convert_from_f32_slice(values);
        let half_input = ArrayD::from_shape_vec(shape, self.f16_staging.clone())?;

        let tensor = Tensor::from_array(half_input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &tensor])?;
        let view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
        let out_shape = view.shape().to_vec();
        let half_out = view.as_standard_layout();
        let half_values = half_out
            .as_slice()
            .ok_or_else(|| anyhow::anyhow!("output tensor is not contiguous"))?;
        let mut widened = vec![0.0f32; half_values.len()];
        half_values.convert_to_f32_slice(&mut widened);
        Ok(ArrayD::from_shape_vec(out_shape, widened)?)
    }
}

impl Upsampler for OrtUpsampler {
    fn scale(&self) -> u32 {
        self.scale
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn upsample(&mut self, tile: &Image) -> Result<Image> {
        let (width, height) = (tile.width() as usize, tile.height() as usize);
        let range = self.normalization_range;
        let padded = reflect_pad(tile.view(), self.pad_align).mapv(|v| to_model_range(v, range));
        let (_, padded_h, padded_w) = padded.dim();
        let input = padded.insert_axis(Axis(0));

        let raw = if self.fp16_input {
            self.run_f16(input)
        } else {
            self.run_f32(input)
        }
        .map_err(|e| {
            classify_inference_error(
                &format!("{e:#}"),
                tile.width().max(tile.height()),
                self.precision,
            )
        })?;

        let output = raw
            .into_dimensionality::<Ix4>()
            .map_err(|e| UpscaleError::DimensionMismatch(format!("model output is not NCHW: {e}")))?;
        let scale = self.scale as usize;
        let expected = [1, CHANNELS, padded_h * scale, padded_w * scale];
        if output.shape() != expected {
            return Err(UpscaleError::DimensionMismatch(format!(
                "model output shape {:?}, expected {:?}",
                output.shape(),
                expected
            )));
        }

        let cropped = output
            .slice(s![0, .., ..height * scale, ..width * scale])
            .mapv(|v| from_model_range(v, range));
        Image::new(cropped, self.precision)
    }

    fn release_transient(&mut self) {
        self.f16_staging = Vec::new();
    }
}

/// Loads registry models from disk into ONNX Runtime sessions.
pub struct OrtModelLoader {
    registry: ModelRegistry,
    backend: InferenceBackend,
    trt_cache_dir: PathBuf,
}

impl OrtModelLoader {
    pub fn new(registry: ModelRegistry, backend: InferenceBackend, trt_cache_dir: PathBuf) -> Self {
        Self {
            registry,
            backend,
            trt_cache_dir,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }
}

impl ModelLoader for OrtModelLoader {
    /// Registered and present on disk.
    fn contains(&self, model_id: &str) -> bool {
        self.registry.is_downloaded(model_id)
    }

    fn load(&self, model_id: &str, precision: Precision) -> Result<Box<dyn Upsampler>> {
        let load_error = |message: String| UpscaleError::LoadError {
            model_id: model_id.to_string(),
            message,
        };
        let entry = self
            .registry
            .get(model_id)
            .ok_or_else(|| UpscaleError::NotFound {
                model_id: model_id.to_string(),
            })?;
        let scale = entry.scale.ok_or_else(|| {
            load_error(format!(
                "native scale of {} is unknown; add an x2/x4 marker to the file name",
                entry.filename
            ))
        })?;
        let model_path = self.registry.models_dir().join(&entry.filename);

        info!(
            model = %model_id,
            path = %model_path.display(),
            backend = %self.backend,
            requested = %precision,
            "Building ONNX Runtime session"
        );
        let session = build_session(&SessionConfig {
            model_path: &model_path,
            backend: self.backend,
            trt_cache_dir: &self.trt_cache_dir,
        })
        .map_err(|e| load_error(format!("{e:#}")))?;

        let upsampler = OrtUpsampler::from_session(session, entry, scale);
        check_precision(precision, upsampler.precision()).map_err(load_error)?;
        if upsampler.precision() != precision {
            debug!(
                model = %model_id,
                requested = %precision,
                effective = %upsampler.precision(),
                "f32-input model runs in full precision"
            );
        }
        Ok(Box::new(upsampler))
    }

    fn release(&self, model_id: &str) {
        debug!(model = %model_id, "ONNX Runtime session dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_index() {
        assert_eq!(mirror_index(0, 4), 0);
        assert_eq!(mirror_index(3, 4), 3);
        assert_eq!(mirror_index(4, 4), 3);
        assert_eq!(mirror_index(5, 4), 2);
        assert_eq!(mirror_index(7, 4), 0);
        assert_eq!(mirror_index(8, 4), 0);
        // single-pixel edges never index out of bounds
        assert_eq!(mirror_index(3, 1), 0);
    }

    #[test]
    fn test_pad_amount() {
        assert_eq!(pad_amount(64, 4), 0);
        assert_eq!(pad_amount(65, 4), 3);
        assert_eq!(pad_amount(30, 16), 2);
        assert_eq!(pad_amount(7, 1), 0);
        assert_eq!(pad_amount(7, 0), 0);
    }

    #[test]
    fn test_reflect_pad_mirrors_edges() {
        let data = Array3::from_shape_fn((3, 2, 3), |(c, y, x)| (c * 100 + y * 10 + x) as f32);
        let padded = reflect_pad(data.view(), 4);
        assert_eq!(padded.dim(), (3, 4, 4));
        assert_eq!(padded.slice(s![.., ..2, ..3]), data);
        // column 3 mirrors column 2, rows 2..4 mirror rows 1..=0
        assert_eq!(padded[[0, 0, 3]], 2.0);
        assert_eq!(padded[[1, 2, 0]], 110.0);
        assert_eq!(padded[[2, 3, 3]], 202.0);
    }

    #[test]
    fn test_reflect_pad_aligned_is_copy() {
        let data = Array3::from_elem((3, 8, 8), 0.5f32);
        assert_eq!(reflect_pad(data.view(), 4), data);
    }

    #[test]
    fn test_model_range_mapping() {
        let range = (0.0, 255.0);
        assert_eq!(to_model_range(0.5, range), 127.5);
        assert_eq!(from_model_range(127.5, range), 0.5);
        assert_eq!(to_model_range(0.25, (0.0, 1.0)), 0.25);
        assert_eq!(from_model_range(0.0, (-1.0, 1.0)), 0.5);
    }

    #[test]
    fn test_check_precision() {
        assert!(check_precision(Precision::Reduced, Precision::Reduced).is_ok());
        assert!(check_precision(Precision::Reduced, Precision::Full).is_ok());
        assert!(check_precision(Precision::Full, Precision::Full).is_ok());
        let err = check_precision(Precision::Full, Precision::Reduced).unwrap_err();
        assert!(err.contains("float16"));
    }

    #[test]
    fn test_classify_out_of_memory() {
        let err = classify_inference_error(
            "Failed to allocate memory for requested buffer of size 1073741824",
            512,
            Precision::Full,
        );
        assert!(matches!(
            err,
            UpscaleError::ResourceExhausted { tile_size: 512, .. }
        ));

        let err = classify_inference_error("CUDA failure 2: out of memory", 256, Precision::Reduced);
        assert!(err.is_resource_exhausted());
    }

    #[test]
    fn test_classify_missing_half_kernel() {
        let message = "Could not find an implementation for Conv(11) node with name 'conv_first' (tensor(float16))";
        assert!(classify_inference_error(message, 128, Precision::Reduced).is_precision_unsupported());
        assert!(matches!(
            classify_inference_error(message, 128, Precision::Full),
            UpscaleError::Inference { .. }
        ));
    }

    #[test]
    fn test_classify_other_failures() {
        let err = classify_inference_error("Invalid input name: image.1", 64, Precision::Reduced);
        assert!(matches!(err, UpscaleError::Inference { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_loader_contains_requires_file() {
        let dir = tempfile::tempdir().unwrap();
        let loader = OrtModelLoader::new(
            ModelRegistry::with_builtin_models(dir.path().to_path_buf()),
            InferenceBackend::Cpu,
            dir.path().join("trt_cache"),
        );
        assert!(!loader.contains("RealESRGAN_x4plus"));
        assert!(!loader.contains("not-a-model"));

        std::fs::write(dir.path().join("RealESRGAN_x4plus.onnx"), b"fake").unwrap();
        assert!(loader.contains("RealESRGAN_x4plus"));
    }

    #[test]
    fn test_loader_rejects_unknown_scale() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mystery.onnx"), b"fake").unwrap();
        let mut registry = ModelRegistry::new(dir.path().to_path_buf());
        registry.discover().unwrap();
        let loader = OrtModelLoader::new(registry, InferenceBackend::Cpu, dir.path().join("trt"));

        let err = loader.load("mystery", Precision::Full).err().unwrap();
        assert!(matches!(err, UpscaleError::LoadError { .. }));
        assert!(err.to_string().contains("native scale"));
    }

    #[test]
    #[ignore] // requires TILESCALE_TEST_MODELS_DIR with RealESRGAN_x4plus.onnx and a CUDA device
    fn test_realesrgan_upsample_tile() {
        let models_dir = PathBuf::from(std::env::var("TILESCALE_TEST_MODELS_DIR").unwrap());
        let loader = OrtModelLoader::new(
            ModelRegistry::with_builtin_models(models_dir.clone()),
            InferenceBackend::Cuda,
            models_dir.join("trt_cache"),
        );
        let mut upsampler = loader.load("RealESRGAN_x4plus", Precision::Reduced).unwrap();
        let tile = Image::filled(30, 17, 0.5).unwrap();
        let out = upsampler.upsample(&tile).unwrap();
        assert_eq!((out.width(), out.height()), (120, 68));
    }
}
