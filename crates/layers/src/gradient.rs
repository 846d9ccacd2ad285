//! Gradient reversal for adversarial feature learning.
//!
//! The forward pass is the identity; during backpropagation the incoming
//! gradient is multiplied by `-alpha`. It is expressed with `detach` so it works
//! with Candle's regular autograd: `x.detach() + (x - x.detach()) * -alpha`
//! evaluates to exactly `x`, while only the second term carries gradient.

use candle_core::{Result, Tensor};

/// Identity whose gradient is scaled by `-alpha`.
pub fn reverse_gradient(input: &Tensor, alpha: f64) -> Result<Tensor> {
    let frozen = input.detach();
    let live = input.sub(&frozen)?.affine(-alpha, 0.0)?;
    frozen.add(&live)
}

/// Stateless layer wrapper around [`reverse_gradient`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientReversal {
    alpha: f64,
}

impl GradientReversal {
    pub fn new(alpha: f64) -> Self {
        Self { alpha }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        reverse_gradient(input, self.alpha)
    }
}
