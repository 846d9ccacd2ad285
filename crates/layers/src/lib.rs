//! Building blocks shared by the attention and fusion crates.
//!
//! Everything here is assembled from Candle primitives: dense projections,
//! activations, dropout, batch normalisation, the classifier MLP, the 1-D
//! convolutional feature extractor and the gradient reversal helper. Learnable
//! tensors are stored as [`candle_core::Var`] so an external optimiser can
//! update them in place; every parametric layer exposes them through
//! [`Module::parameters`].

pub mod activations;
pub mod checks;
pub mod conv;
pub mod dropout;
pub mod dtypes;
pub mod gradient;
pub mod linear;
pub mod mlp;
pub mod norm;

use candle_core::Var;
use thiserror::Error;

/// Errors raised while wiring layers from configuration values.
#[derive(Debug, Error)]
pub enum LayerError {
    /// A configuration value is outside the accepted range.
    #[error("invalid layer configuration: {0}")]
    InvalidConfig(String),
}

impl From<LayerError> for candle_core::Error {
    fn from(err: LayerError) -> Self {
        candle_core::Error::Msg(err.to_string())
    }
}

/// Parameter ownership and train/eval switching shared by every layer.
pub trait Module {
    /// Learnable tensors owned by the layer, in a stable order.
    fn parameters(&self) -> Vec<Var>;

    /// Toggles training-only behaviour such as dropout or batch statistics.
    fn set_training(&self, _training: bool) {}
}

/// Total number of scalar parameters across `module`.
pub fn parameter_count(module: &dyn Module) -> usize {
    module
        .parameters()
        .iter()
        .map(|var| var.as_tensor().elem_count())
        .sum()
}
