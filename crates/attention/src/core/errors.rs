//! Error types emitted by attention implementations.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// The block does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// Hyper-parameters that cannot describe a valid module.
    #[error("invalid attention configuration: {0}")]
    InvalidConfig(String),
    /// A backend-specific failure propagated to the caller.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    /// Shape error with a formatted context string.
    pub fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }

    /// Re-labels a failed `layers::checks` assertion as a shape error.
    pub(crate) fn from_check(err: candle_core::Error) -> Self {
        Self::InvalidShape {
            context: err.to_string(),
        }
    }
}

impl From<layers::LayerError> for AttentionError {
    fn from(err: layers::LayerError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}
