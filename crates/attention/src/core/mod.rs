//! Core traits and types shared across attention implementations.
//!
//! Query/key/value attention operates on `[batch, ..., seq_len, dim]` tensors
//! and returns both the attended values and the probability tensor so callers
//! can inspect or pool with the weights. Softmax normalisation always runs in
//! at least `f32`; outputs are cast back to the query dtype.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::{Config, PrecisionMode};
pub use errors::AttentionError;

/// Attended values together with the attention probabilities that produced them.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Weighted values, `[batch, ..., q_len, dim]`.
    pub output: Tensor,
    /// Probabilities, `[batch, ..., q_len, k_len]`; rows sum to one.
    pub weights: Tensor,
}

/// Unified interface for query/key/value attention.
///
/// * `q` is `[batch, ..., q_len, d]`, `k` is `[batch, ..., k_len, d]` and `v`
///   is `[batch, ..., k_len, d_v]`.
/// * `mask`, when present, is a validity mask (non-zero = may attend) that is
///   either `[batch, k_len]` or broadcastable to `[batch, ..., q_len, k_len]`.
pub trait Attention {
    /// Compute attention with an optional validity mask.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<AttentionOutput, AttentionError>;
}
