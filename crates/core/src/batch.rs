//! File-level upscaling and directory batches.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{error, info};

use crate::engine::{UpscaleEngine, UpscaleRequest};
use crate::image_io::{default_output_name, is_supported_image, load_image, save_image};
use crate::progress::{ProgressEvent, ProgressSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputOptions {
    pub format: String,
    pub jpeg_quality: u8,
}

/// Load `input`, upscale it, and write the result to `output`.
///
/// Emits `ImageComplete` on success.
pub fn upscale_file(
    engine: &UpscaleEngine,
    input: &Path,
    output: &Path,
    request: &UpscaleRequest,
    options: &OutputOptions,
) -> Result<()> {
    let started = Instant::now();
    let image = load_image(input)?;
    let upscaled = engine
        .upscale(&image, request)
        .with_context(|| format!("Failed to upscale {}", input.display()))?;
    save_image(&upscaled, output, &options.format, options.jpeg_quality)?;

    let duration_seconds = started.elapsed().as_secs_f64();
    info!(
        input = %input.display(),
        output = %output.display(),
        model = %request.model_id,
        duration_seconds,
        "Saved upscaled image"
    );
    engine.progress().emit(ProgressEvent::ImageComplete {
        input: input.display().to_string(),
        output: output.display().to_string(),
        duration_seconds,
    });
    Ok(())
}

/// Supported image files under `dir`, sorted by path.
pub fn find_images(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("Input directory does not exist: {}", dir.display());
    }

    let mut images = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current)
            .with_context(|| format!("Failed to read directory: {}", current.display()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if recursive {
                    pending.push(path);
                }
            } else if path.is_file() && is_supported_image(&path) {
                images.push(path);
            }
        }
    }
    images.sort();
    Ok(images)
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub recursive: bool,
    pub skip_existing: bool,
    pub output: OutputOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub input: PathBuf,
    pub output: PathBuf,
}

/// Pair every input image with its output path. Sub-directories relative to
/// the input directory are preserved under the output directory.
pub fn plan_batch(options: &BatchOptions, request: &UpscaleRequest) -> Result<Vec<BatchItem>> {
    let images = find_images(&options.input_dir, options.recursive)?;
    let items = images
        .into_iter()
        .map(|input| {
            let relative_dir = input
                .strip_prefix(&options.input_dir)
                .ok()
                .and_then(Path::parent)
                .map(Path::to_path_buf)
                .unwrap_or_default();
            let name = default_output_name(
                &input,
                request.target_scale,
                &request.model_id,
                &options.output.format,
            );
            BatchItem {
                output: options.output_dir.join(relative_dir).join(name),
                input,
            }
        })
        .collect();
    Ok(items)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed(PathBuf),
    Skipped(PathBuf),
    Failed(String),
}

/// Process one batch item. Failures are reported as an outcome, never
/// propagated, so one bad image does not stop the batch.
pub fn process_item(
    engine: &UpscaleEngine,
    item: &BatchItem,
    request: &UpscaleRequest,
    options: &BatchOptions,
) -> ItemOutcome {
    if options.skip_existing && item.output.exists() {
        info!(output = %item.output.display(), "Skipping, output exists");
        return ItemOutcome::Skipped(item.output.clone());
    }

    match upscale_file(engine, &item.input, &item.output, request, &options.output) {
        Ok(()) => ItemOutcome::Completed(item.output.clone()),
        Err(e) => {
            let message = format!("{e:#}");
            error!(input = %item.input.display(), error = %message, "Failed to process image");
            engine.progress().emit(ProgressEvent::ImageError {
                input: item.input.display().to_string(),
                error: message.clone(),
            });
            ItemOutcome::Failed(format!("{}: {message}", item.input.display()))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub total: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outputs: Vec<PathBuf>,
    pub errors: Vec<String>,
}

impl BatchResult {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn done(&self) -> usize {
        self.completed + self.skipped + self.failed
    }

    /// Tally `outcome` for `input` and emit `BatchProgress`.
    pub fn record(&mut self, input: &Path, outcome: ItemOutcome, progress: &ProgressSink) {
        match outcome {
            ItemOutcome::Completed(output) => {
                self.completed += 1;
                self.outputs.push(output);
            }
            ItemOutcome::Skipped(_) => self.skipped += 1,
            ItemOutcome::Failed(message) => {
                self.failed += 1;
                self.errors.push(message);
            }
        }
        progress.emit(ProgressEvent::BatchProgress {
            done: self.done(),
            total: self.total,
            current: input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        });
    }
}

/// Upscale every image in `options.input_dir` sequentially.
pub fn run_batch(
    engine: &UpscaleEngine,
    options: &BatchOptions,
    request: &UpscaleRequest,
) -> Result<BatchResult> {
    let items = plan_batch(options, request)?;
    info!(
        input_dir = %options.input_dir.display(),
        images = items.len(),
        model = %request.model_id,
        "Starting batch"
    );

    let mut result = BatchResult::new(items.len());
    for item in &items {
        let outcome = process_item(engine, item, request, options);
        result.record(&item.input, outcome, engine.progress());
    }

    info!(
        completed = result.completed,
        skipped = result.skipped,
        failed = result.failed,
        "Batch finished"
    );
    Ok(result)
}
