use crate::error::Result;
use crate::types::{Image, Precision};

/// A loaded super-resolution capability with a fixed integer scale.
///
/// `upsample` must return an image exactly `scale()` times the input in each
/// dimension. Implementations may fail with `ResourceExhausted` when device
/// memory runs out, or `PrecisionUnsupported` when running in reduced
/// precision is not possible.
pub trait Upsampler: Send {
    fn scale(&self) -> u32;

    fn precision(&self) -> Precision;

    fn upsample(&mut self, tile: &Image) -> Result<Image>;

    /// Free cached device buffers after an out-of-memory failure.
    fn release_transient(&mut self) {}
}

/// Source of [`Upsampler`] instances, keyed by model id.
pub trait ModelLoader: Send + Sync {
    fn contains(&self, model_id: &str) -> bool;

    fn load(&self, model_id: &str, precision: Precision) -> Result<Box<dyn Upsampler>>;

    /// Called after the cache has dropped its last handle to `model_id`.
    fn release(&self, _model_id: &str) {}
}
