//! Sequence pooling: learned attention pooling and masked averaging.
//!
//! All poolers take `(batch, seq, emb_dim)` features and an optional
//! `(batch, seq)` validity mask and return `(batch, emb_dim)`.

use candle_core::{DType, Device, Tensor, Var};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    Module,
};

use crate::core::AttentionError;
use crate::masks::masked_softmax;

fn expect_features(
    context: &str,
    input: &Tensor,
    emb_dim: usize,
    mask: Option<&Tensor>,
) -> Result<(usize, usize), AttentionError> {
    let (batch, seq) =
        checks::expect_batch_seq_hidden(context, input, emb_dim).map_err(AttentionError::from_check)?;
    if seq == 0 {
        return Err(AttentionError::shape(format!("{context}: sequence length must be non-zero")));
    }
    if let Some(mask) = mask {
        checks::expect_shape(&format!("{context}.mask"), mask, &[batch, seq])
            .map_err(AttentionError::from_check)?;
    }
    Ok((batch, seq))
}

/// Scores each position with a `Linear(emb_dim, 1)` and pools with the softmax weights.
#[derive(Debug, Clone)]
struct ScoredPooling {
    emb_dim: usize,
    score: Linear,
}

impl ScoredPooling {
    fn new(emb_dim: usize, device: &Device, dtype: DType) -> Result<Self, AttentionError> {
        let score = Linear::with_init(
            LinearConfig::new(emb_dim, 1),
            &LinearInit::TorchDefault,
            device,
            dtype,
        )?;
        Ok(Self { emb_dim, score })
    }

    /// Returns `(pooled (batch, emb_dim), weights (batch, 1, seq))`.
    fn pool(
        &self,
        context: &str,
        input: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        let (batch, seq) = expect_features(context, input, self.emb_dim, mask)?;
        let policy = PrecisionPolicy::for_tensor(input);
        let scores = self.score.forward(input, &policy)?.reshape((batch, seq))?;
        let weights = masked_softmax(&scores, mask)?.unsqueeze(1)?;
        let pooled = policy
            .cast_for_matmul(&weights)?
            .matmul(&policy.cast_for_matmul(input)?.contiguous()?)?
            .squeeze(1)?;
        Ok((policy.cast_to_storage(&pooled)?, weights))
    }
}

/// Attention pooling returning only the pooled features.
#[derive(Debug, Clone)]
pub struct AttentionPooling {
    inner: ScoredPooling,
}

impl AttentionPooling {
    pub fn new(emb_dim: usize, device: &Device, dtype: DType) -> Result<Self, AttentionError> {
        Ok(Self {
            inner: ScoredPooling::new(emb_dim, device, dtype)?,
        })
    }

    /// Scoring projection, exposed so callers can load trained weights.
    pub fn score_layer(&self) -> &Linear {
        &self.inner.score
    }

    pub fn forward(&self, input: &Tensor, mask: Option<&Tensor>) -> Result<Tensor, AttentionError> {
        Ok(self.inner.pool("attention_pooling.input", input, mask)?.0)
    }
}

impl Module for AttentionPooling {
    fn parameters(&self) -> Vec<Var> {
        self.inner.score.parameters()
    }
}

/// Attention pooling that also returns the `(batch, 1, seq)` weights.
#[derive(Debug, Clone)]
pub struct MaskAttention {
    inner: ScoredPooling,
}

impl MaskAttention {
    pub fn new(emb_dim: usize, device: &Device, dtype: DType) -> Result<Self, AttentionError> {
        Ok(Self {
            inner: ScoredPooling::new(emb_dim, device, dtype)?,
        })
    }

    pub fn score_layer(&self) -> &Linear {
        &self.inner.score
    }

    /// Returns `(pooled, weights)`.
    pub fn forward(
        &self,
        input: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        self.inner.pool("mask_attention.input", input, mask)
    }
}

impl Module for MaskAttention {
    fn parameters(&self) -> Vec<Var> {
        self.inner.score.parameters()
    }
}

/// Mean over valid positions.
///
/// Without a mask this is the plain mean over the sequence axis. A row with no
/// valid position divides by zero and yields NaN.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvgPooling;

impl AvgPooling {
    pub fn forward(&self, input: &Tensor, mask: Option<&Tensor>) -> Result<Tensor, AttentionError> {
        let emb_dim = match input.dims() {
            [_, _, emb_dim] => *emb_dim,
            dims => {
                return Err(AttentionError::shape(format!(
                    "avg_pooling.input: expected (batch, seq, emb_dim), got {dims:?}"
                )))
            }
        };
        let (batch, seq) = expect_features("avg_pooling.input", input, emb_dim, mask)?;
        let policy = PrecisionPolicy::for_tensor(input);
        let wide = policy.cast_for_reduction(input)?;
        let pooled = match mask {
            None => wide.mean(1)?,
            Some(mask) => {
                let keep = mask
                    .ne(&mask.zeros_like()?)?
                    .to_dtype(wide.dtype())?
                    .reshape((batch, seq, 1))?;
                let total = wide.broadcast_mul(&keep)?.sum(1)?;
                let count = keep.sum(1)?;
                total.broadcast_div(&count)?
            }
        };
        Ok(policy.cast_to_storage(&pooled)?)
    }
}
