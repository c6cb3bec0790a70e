use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::compositor::TileCompositor;
use crate::error::{Result, UpscaleError};
use crate::model_cache::{ModelCache, ModelLease};
use crate::passes::PassComposer;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::resample::{LanczosResampler, Resampler};
use crate::retry::OomRetryPolicy;
use crate::types::{Image, Precision};

pub const DEFAULT_TARGET_SCALE: u32 = 4;
pub const DEFAULT_TILE_SIZE: u32 = 512;
pub const DEFAULT_TILE_OVERLAP: u32 = 32;

/// Precision of the working buffers for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionMode {
    /// Follow the precision the model was loaded in.
    #[default]
    Auto,
    /// Keep intermediate images in full precision regardless of the model.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpscaleRequest {
    pub model_id: String,
    pub target_scale: u32,
    pub tile_size: u32,
    pub overlap: u32,
    #[serde(default)]
    pub precision: PrecisionMode,
}

impl UpscaleRequest {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            target_scale: DEFAULT_TARGET_SCALE,
            tile_size: DEFAULT_TILE_SIZE,
            overlap: DEFAULT_TILE_OVERLAP,
            precision: PrecisionMode::Auto,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.target_scale == 0 {
            return Err(UpscaleError::invalid("target scale must be at least 1"));
        }
        if self.tile_size == 0 {
            return Err(UpscaleError::invalid("tile_size must be greater than 0"));
        }
        if self.overlap >= self.tile_size {
            return Err(UpscaleError::invalid(format!(
                "tile_size ({}) must be greater than overlap ({})",
                self.tile_size, self.overlap
            )));
        }
        Ok(())
    }
}

/// Upscales images with cached models, tiling each pass and recovering from
/// out-of-memory and reduced-precision failures.
pub struct UpscaleEngine {
    cache: Arc<ModelCache>,
    resampler: Arc<dyn Resampler>,
    retry: OomRetryPolicy,
}

impl UpscaleEngine {
    pub fn new(cache: Arc<ModelCache>) -> Self {
        Self {
            cache,
            resampler: Arc::new(LanczosResampler),
            retry: OomRetryPolicy::default(),
        }
    }

    pub fn with_resampler(mut self, resampler: Arc<dyn Resampler>) -> Self {
        self.resampler = resampler;
        self
    }

    pub fn with_retry_policy(mut self, retry: OomRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    pub fn progress(&self) -> &Arc<ProgressSink> {
        self.cache.progress()
    }

    pub fn upscale(&self, image: &Image, request: &UpscaleRequest) -> Result<Image> {
        request.validate()?;
        let started = Instant::now();
        let model_id = request.model_id.as_str();

        let mut lease = self.cache.get(model_id)?;
        let mut fell_back = false;
        let output = loop {
            match self.run(image, request, &lease) {
                Ok(output) => break output,
                Err(err)
                    if err.is_precision_unsupported()
                        && lease.precision() == Precision::Reduced
                        && !fell_back =>
                {
                    warn!(
                        model = %model_id,
                        error = %err,
                        "Reduced precision failed, reloading model in full precision"
                    );
                    drop(lease);
                    lease = self.cache.mark_incompatible_and_reload(model_id)?;
                    self.progress().emit(ProgressEvent::PrecisionFallback {
                        model_id: model_id.to_string(),
                    });
                    fell_back = true;
                }
                Err(err) => return Err(err.with_model_id(model_id)),
            }
        };

        info!(
            model = %model_id,
            width = output.width(),
            height = output.height(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Upscale complete"
        );
        Ok(output)
    }

    fn run(&self, image: &Image, request: &UpscaleRequest, lease: &ModelLease) -> Result<Image> {
        let working = match request.precision {
            PrecisionMode::Auto => lease.precision(),
            PrecisionMode::Full => Precision::Full,
        };
        let input = image.to_precision(working);
        let progress = self.progress();
        let composer = PassComposer::new(self.resampler.as_ref());

        let output = composer.upscale(&input, lease.scale(), request.target_scale, |pass_input, ctx| {
            self.retry.run(
                request.tile_size,
                request.overlap,
                |tile_size, overlap| {
                    TileCompositor::new(ctx.native_scale, tile_size, overlap)?.process(
                        pass_input,
                        |tile| lease.upsample(tile),
                        |tiles_done, tiles_total| {
                            progress.emit(ProgressEvent::TileProgress {
                                pass_num: ctx.pass_num(),
                                total_passes: ctx.total_passes,
                                tiles_done,
                                tiles_total,
                            })
                        },
                    )
                },
                |reduction| {
                    lease.release_transient();
                    progress.emit(ProgressEvent::TileSizeReduced {
                        model_id: lease.id().to_string(),
                        from: reduction.from,
                        to: reduction.to,
                    });
                },
            )
        })?;

        Ok(output.to_precision(Precision::Full))
    }
}

impl std::fmt::Debug for UpscaleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpscaleEngine")
            .field("cache", &self.cache)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
