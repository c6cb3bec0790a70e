//! Execution provider selection for ONNX Runtime sessions.
//!
//! [`build_session`] registers the provider chain for an [`InferenceBackend`]:
//! TensorRT falls back to CUDA, CUDA falls back to ORT's CPU provider.

use std::fmt;
use std::path::Path;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, error, info, warn};

const TRT_HEARTBEAT: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InferenceBackend {
    #[default]
    Cuda,
    /// Needs `libnvinfer.so.10` / `nvinfer.dll`; CUDA is registered behind it.
    Tensorrt,
    Cpu,
}

impl InferenceBackend {
    /// Case-insensitive; `None` for names that are not a known backend.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" => Some(Self::Cuda),
            "tensorrt" | "trt" => Some(Self::Tensorrt),
            "cpu" => Some(Self::Cpu),
            _ => None,
        }
    }
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: &'a Path,
}

/// File count and byte total of the engine cache, to tell a fresh TensorRT
/// build from a cache hit in the logs.
fn engine_cache_footprint(root: &Path) -> (u64, u64) {
    let mut files = 0;
    let mut bytes = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                pending.push(entry.path());
            } else if meta.is_file() {
                files += 1;
                bytes += meta.len();
            }
        }
    }
    (files, bytes)
}

fn build_tensorrt_session(config: &SessionConfig<'_>) -> Result<Session> {
    let cache_dir = config.trt_cache_dir;
    if let Err(e) = std::fs::create_dir_all(cache_dir) {
        warn!(dir = %cache_dir.display(), error = %e, "Failed to create TensorRT cache directory");
    }
    let (files_before, bytes_before) = engine_cache_footprint(cache_dir);
    info!(
        model = %config.model_path.display(),
        cache_dir = %cache_dir.display(),
        cache_files = files_before,
        "Building TensorRT session (an uncached engine build can take minutes)"
    );

    let started = Instant::now();
    let (done_tx, done_rx) = channel::<()>();
    let heartbeat = thread::spawn(move || loop {
        match done_rx.recv_timeout(TRT_HEARTBEAT) {
            Err(RecvTimeoutError::Timeout) => info!(
                elapsed_secs = started.elapsed().as_secs(),
                "TensorRT engine build still running"
            ),
            _ => break,
        }
    });

    let cache_path = cache_dir.to_string_lossy().to_string();
    let result = (|| -> Result<Session> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_engine_cache(true)
                    .with_engine_cache_path(&cache_path)
                    .with_fp16(true)
                    .with_device_id(0)
                    .build(),
                CUDAExecutionProvider::default().build(),
            ])?
            .commit_from_file(config.model_path)?;
        Ok(session)
    })()
    .with_context(|| format!("Failed to load ONNX model: {}", config.model_path.display()));

    let _ = done_tx.send(());
    let _ = heartbeat.join();

    let elapsed_secs = started.elapsed().as_secs_f64();
    let (files_after, bytes_after) = engine_cache_footprint(cache_dir);
    match &result {
        Ok(_) => info!(
            elapsed_secs,
            engine_built = files_after > files_before || bytes_after > bytes_before,
            cache_files = files_after,
            cache_bytes = bytes_after,
            "TensorRT session ready"
        ),
        Err(e) => error!(elapsed_secs, error = %e, "TensorRT session initialization failed"),
    }
    result
}

/// Build a session for `config.model_path` on the configured backend.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    match config.backend {
        InferenceBackend::Tensorrt => build_tensorrt_session(config),
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }
            debug!(model = %config.model_path.display(), "Building session with CUDA EP");

            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_execution_providers([cuda.build()])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?;
            Ok(session)
        }
        InferenceBackend::Cpu => {
            debug!(model = %config.model_path.display(), "Building session on CPU");
            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?;
            Ok(session)
        }
    }
}
