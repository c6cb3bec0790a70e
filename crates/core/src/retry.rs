//! Out-of-memory recovery by halving the tile size.

use tracing::warn;

use crate::error::{Result, UpscaleError};
use crate::types::Image;

/// Smallest tile edge the retry policy will shrink to.
pub const MIN_TILE_SIZE: u32 = 64;

/// A tile size reduction performed after the upsampler ran out of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileReduction {
    pub from: u32,
    pub to: u32,
    pub overlap: u32,
}

/// Retries a whole tile pass with halved tiles whenever it fails with
/// [`UpscaleError::ResourceExhausted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OomRetryPolicy {
    min_tile_size: u32,
}

impl Default for OomRetryPolicy {
    fn default() -> Self {
        Self {
            min_tile_size: MIN_TILE_SIZE,
        }
    }
}

impl OomRetryPolicy {
    pub fn with_min_tile_size(min_tile_size: u32) -> Self {
        Self {
            min_tile_size: min_tile_size.max(1),
        }
    }

    pub fn min_tile_size(&self) -> u32 {
        self.min_tile_size
    }

    /// Run `attempt(tile_size, overlap)` until it succeeds, fails with a
    /// non-exhaustion error, or the tile size cannot shrink any further.
    ///
    /// `on_reduced` runs between attempts; callers use it to free transient
    /// device memory and to report the new size.
    pub fn run<A, R>(
        &self,
        tile_size: u32,
        overlap: u32,
        mut attempt: A,
        mut on_reduced: R,
    ) -> Result<Image>
    where
        A: FnMut(u32, u32) -> Result<Image>,
        R: FnMut(TileReduction),
    {
        let mut tile = tile_size;
        loop {
            let effective_overlap = clamp_overlap(tile, overlap);
            let err = match attempt(tile, effective_overlap) {
                Ok(image) => return Ok(image),
                Err(err) if err.is_resource_exhausted() => err,
                Err(err) => return Err(err),
            };

            let next = (tile / 2).max(self.min_tile_size);
            if next >= tile {
                warn!(tile_size = tile, "Out of memory at minimum tile size, giving up");
                return Err(at_tile_size(err, tile));
            }

            let next_overlap = clamp_overlap(next, overlap);
            warn!(
                from = tile,
                to = next,
                overlap = next_overlap,
                error = %err,
                "Out of memory, retrying with smaller tiles"
            );
            on_reduced(TileReduction {
                from: tile,
                to: next,
                overlap: next_overlap,
            });
            tile = next;
        }
    }
}

fn clamp_overlap(tile_size: u32, overlap: u32) -> u32 {
    if overlap >= tile_size {
        tile_size / 2
    } else {
        overlap
    }
}

fn at_tile_size(err: UpscaleError, tile_size: u32) -> UpscaleError {
    match err {
        UpscaleError::ResourceExhausted {
            model_id, message, ..
        } => UpscaleError::ResourceExhausted {
            model_id,
            tile_size,
            message,
        },
        other => other,
    }
}
