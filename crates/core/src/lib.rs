//! Tiled super-resolution engine.
//!
//! Images are split into overlapping tiles, each tile is run through a model,
//! and the outputs are feather-blended back together. Targets beyond a model's
//! native scale are reached with chained passes plus a Lanczos correction.

pub mod backend;
pub mod batch;
pub mod blend;
pub mod comparison;
pub mod compositor;
pub mod config;
pub mod engine;
pub mod error;
pub mod image_io;
pub mod logging;
pub mod model_cache;
pub mod model_registry;
pub mod ort_upsampler;
pub mod passes;
pub mod progress;
pub mod resample;
pub mod retry;
pub mod runtime;
pub mod tiling;
pub mod types;
pub mod upsampler;

pub use engine::{PrecisionMode, UpscaleEngine, UpscaleRequest};
pub use error::{Result, Stage, UpscaleError};
pub use model_cache::{ModelCache, ModelLease};
pub use progress::{ProgressEvent, ProgressSink, SubscriptionId};
pub use types::{Image, Precision};
pub use upsampler::{ModelLoader, Upsampler};
