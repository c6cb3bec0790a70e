//! Typed errors for the tiling engine.
//!
//! The engine layers (grid, compositor, retry policy, pass composer, cache)
//! return [`UpscaleError`] so callers can tell recoverable failures apart from
//! fatal ones without string matching. Collaborator layers (config, registry,
//! image I/O, batch/compare runners) use `anyhow` and wrap these at their seams.

use std::fmt;

/// Pipeline stage an error originated from, for user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configuration,
    Load,
    Inference,
    Resample,
    Io,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Load => write!(f, "load"),
            Self::Inference => write!(f, "inference"),
            Self::Resample => write!(f, "resample"),
            Self::Io => write!(f, "io"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpscaleError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("unknown model: {model_id}")]
    NotFound { model_id: String },

    #[error("{}", describe_exhausted(.model_id, .tile_size, .message))]
    ResourceExhausted {
        model_id: Option<String>,
        tile_size: u32,
        message: String,
    },

    #[error("{}", describe_precision(.model_id, .message))]
    PrecisionUnsupported {
        model_id: Option<String>,
        message: String,
    },

    #[error("failed to load model {model_id}: {message}")]
    LoadError { model_id: String, message: String },

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("{}", describe_inference(.model_id, .message))]
    Inference {
        model_id: Option<String>,
        message: String,
    },

    #[error("resample failed: {0}")]
    Resample(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_exhausted(model_id: &Option<String>, tile_size: &u32, message: &str) -> String {
    match model_id {
        Some(id) => format!("out of memory running model {id} at tile_size={tile_size}: {message}"),
        None => format!("out of memory at tile_size={tile_size}: {message}"),
    }
}

fn describe_precision(model_id: &Option<String>, message: &str) -> String {
    match model_id {
        Some(id) => format!("model {id} does not support reduced precision: {message}"),
        None => format!("reduced precision unsupported: {message}"),
    }
}

fn describe_inference(model_id: &Option<String>, message: &str) -> String {
    match model_id {
        Some(id) => format!("inference failed for model {id}: {message}"),
        None => format!("inference failed: {message}"),
    }
}

impl UpscaleError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn exhausted(tile_size: u32, msg: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            model_id: None,
            tile_size,
            message: msg.into(),
        }
    }

    pub fn precision(msg: impl Into<String>) -> Self {
        Self::PrecisionUnsupported {
            model_id: None,
            message: msg.into(),
        }
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference {
            model_id: None,
            message: msg.into(),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::InvalidConfiguration(_) => Stage::Configuration,
            Self::NotFound { .. } | Self::LoadError { .. } => Stage::Load,
            Self::ResourceExhausted { .. }
            | Self::PrecisionUnsupported { .. }
            | Self::DimensionMismatch(_)
            | Self::Inference { .. } => Stage::Inference,
            Self::Resample(_) => Stage::Resample,
            Self::Io(_) => Stage::Io,
        }
    }

    /// Whether the engine may recover from this error internally.
    ///
    /// `ResourceExhausted` is retried with smaller tiles, `PrecisionUnsupported`
    /// with a full-precision reload. Everything else is fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. } | Self::PrecisionUnsupported { .. }
        )
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }

    pub fn is_precision_unsupported(&self) -> bool {
        matches!(self, Self::PrecisionUnsupported { .. })
    }

    /// Attach a model id to errors raised below the cache, where the id is unknown.
    pub fn with_model_id(mut self, id: &str) -> Self {
        match &mut self {
            Self::ResourceExhausted { model_id, .. }
            | Self::PrecisionUnsupported { model_id, .. }
            | Self::Inference { model_id, .. } => {
                if model_id.is_none() {
                    *model_id = Some(id.to_string());
                }
            }
            _ => {}
        }
        self
    }
}

pub type Result<T> = std::result::Result<T, UpscaleError>;
