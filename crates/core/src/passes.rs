//! Reaching an arbitrary target scale with a fixed-scale upsampler.
//!
//! A 4x model asked for 8x runs two passes (16x) and is then resampled down to
//! exactly 8x; asked for 2x it runs one pass and is resampled down to 2x.

use tracing::{debug, info};

use crate::error::{Result, UpscaleError};
use crate::resample::Resampler;
use crate::types::Image;

/// Per-pass state handed to the pass closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassContext {
    /// Zero-based index of this pass.
    pub pass_index: u32,
    pub total_passes: u32,
    pub native_scale: u32,
}

impl PassContext {
    /// One-based pass number, as shown to users.
    pub fn pass_num(&self) -> u32 {
        self.pass_index + 1
    }
}

/// Smallest `p` with `native_scale^p >= target_scale`, or 1 when one pass already suffices.
pub fn compute_passes(target_scale: u32, native_scale: u32) -> Result<u32> {
    if target_scale == 0 || native_scale == 0 {
        return Err(UpscaleError::invalid(format!(
            "scales must be at least 1 (target={target_scale}, native={native_scale})"
        )));
    }
    if target_scale <= native_scale {
        return Ok(1);
    }
    if native_scale == 1 {
        return Err(UpscaleError::invalid(format!(
            "a 1x model cannot reach {target_scale}x"
        )));
    }

    let target = u64::from(target_scale);
    let native = u64::from(native_scale);
    let mut passes = 1;
    let mut achieved = native;
    while achieved < target {
        achieved *= native;
        passes += 1;
    }
    Ok(passes)
}

/// Chains upsampler passes and corrects the final size with a [`Resampler`].
pub struct PassComposer<'a> {
    resampler: &'a dyn Resampler,
}

impl<'a> PassComposer<'a> {
    pub fn new(resampler: &'a dyn Resampler) -> Self {
        Self { resampler }
    }

    /// Run `run_pass` as many times as needed to reach `target_scale`, feeding
    /// each output into the next pass.
    pub fn upscale<F>(
        &self,
        image: &Image,
        native_scale: u32,
        target_scale: u32,
        mut run_pass: F,
    ) -> Result<Image>
    where
        F: FnMut(&Image, PassContext) -> Result<Image>,
    {
        let total_passes = compute_passes(target_scale, native_scale)?;
        let achieved = u64::from(native_scale).pow(total_passes);
        let (orig_w, orig_h) = (image.width(), image.height());
        let (width, height) = scaled_size(orig_w, orig_h, u64::from(target_scale))?;
        scaled_size(orig_w, orig_h, achieved)?;

        let mut current: Option<Image> = None;
        for pass_index in 0..total_passes {
            let ctx = PassContext {
                pass_index,
                total_passes,
                native_scale,
            };
            info!(
                pass = ctx.pass_num(),
                total_passes,
                native_scale,
                "Starting upscale pass"
            );
            let input = current.as_ref().unwrap_or(image);
            current = Some(run_pass(input, ctx)?);
        }
        let mut output = match current {
            Some(output) => output,
            None => return Err(UpscaleError::invalid("no passes were run")),
        };

        if achieved != u64::from(target_scale) {
            debug!(
                achieved,
                target_scale,
                width,
                height,
                "Resampling to exact target scale"
            );
            output = self.resampler.resize(&output, width, height)?;
            output.clamp_unit();
        }

        Ok(output)
    }
}

/// `width x height` multiplied by `scale`, if it still fits in `u32`.
fn scaled_size(width: u32, height: u32, scale: u64) -> Result<(u32, u32)> {
    let scale_dim = |dim: u32| {
        u64::from(dim)
            .checked_mul(scale)
            .and_then(|v| u32::try_from(v).ok())
    };
    match (scale_dim(width), scale_dim(height)) {
        (Some(w), Some(h)) => Ok((w, h)),
        _ => Err(UpscaleError::invalid(format!(
            "{width}x{height} scaled by {scale} does not fit in u32 dimensions"
        ))),
    }
}
