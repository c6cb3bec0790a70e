use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info};

use crate::batch::{upscale_file, OutputOptions};
use crate::engine::{UpscaleEngine, UpscaleRequest};
use crate::image_io::default_output_name;
use crate::progress::ProgressEvent;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelResult {
    pub model_id: String,
    /// `None` when the model failed.
    pub output_path: Option<PathBuf>,
    pub duration_seconds: f64,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonResult {
    pub input_path: PathBuf,
    pub scale: u32,
    pub results: Vec<ModelResult>,
}

/// Runs one image through several models, one at a time.
///
/// Each model is unloaded after its run so the next one starts with the
/// memory the previous model held.
pub struct ComparisonRunner<'a> {
    engine: &'a UpscaleEngine,
}

impl<'a> ComparisonRunner<'a> {
    pub fn new(engine: &'a UpscaleEngine) -> Self {
        Self { engine }
    }

    /// `template` supplies scale, tiling and precision; its model id is
    /// replaced by each entry of `model_ids`.
    pub fn compare(
        &self,
        input: &Path,
        model_ids: &[String],
        template: &UpscaleRequest,
        output_dir: &Path,
        options: &OutputOptions,
    ) -> ComparisonResult {
        let progress = self.engine.progress();
        let total = model_ids.len();
        let mut results = Vec::with_capacity(total);

        for (index, model_id) in model_ids.iter().enumerate() {
            progress.emit(ProgressEvent::ComparisonModelStart {
                model_id: model_id.clone(),
                index,
                total,
            });

            let request = UpscaleRequest {
                model_id: model_id.clone(),
                ..template.clone()
            };
            let output = output_dir.join(default_output_name(
                input,
                request.target_scale,
                model_id,
                &options.format,
            ));

            let started = Instant::now();
            let outcome = upscale_file(self.engine, input, &output, &request, options);
            let duration_seconds = started.elapsed().as_secs_f64();

            let result = match outcome {
                Ok(()) => {
                    info!(model = %model_id, duration_seconds, "Comparison run finished");
                    ModelResult {
                        model_id: model_id.clone(),
                        output_path: Some(output),
                        duration_seconds,
                        success: true,
                        error: None,
                    }
                }
                Err(e) => {
                    error!(model = %model_id, error = %format!("{e:#}"), "Comparison run failed");
                    ModelResult {
                        model_id: model_id.clone(),
                        output_path: None,
                        duration_seconds,
                        success: false,
                        error: Some(format!("{e:#}")),
                    }
                }
            };

            progress.emit(ProgressEvent::ComparisonModelDone {
                model_id: model_id.clone(),
                success: result.success,
                duration_seconds,
            });
            results.push(result);

            self.engine.cache().unload(model_id);
        }

        ComparisonResult {
            input_path: input.to_path_buf(),
            scale: template.target_scale,
            results,
        }
    }
}
