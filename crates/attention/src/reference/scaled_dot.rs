//! Scaled dot-product attention.
//!
//! Computes `softmax(q k^T / sqrt(d)) v` over the trailing two axes. Any
//! number of leading axes is allowed (`[batch, q_len, d]` or
//! `[batch, heads, q_len, d]`) as long as `q`, `k` and `v` agree on them.

use candle_core::{DType, Tensor};
use layers::{checks, dropout::Dropout};

use crate::core::{Attention, AttentionError, AttentionOutput, Config};
use crate::masks::masked_softmax;

/// Numerically stable attention with optional validity mask and dropout.
#[derive(Debug, Clone)]
pub struct ScaledDotProductAttention {
    config: Config,
    dropout: Dropout,
}

impl ScaledDotProductAttention {
    /// Builds the kernel; `seed` drives the dropout mask stream.
    pub fn new(config: Config, seed: u64) -> Result<Self, AttentionError> {
        config.validate()?;
        let dropout = Dropout::new(config.dropout_p, seed);
        Ok(Self { config, dropout })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Enables or disables dropout on the attention probabilities.
    pub fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }
}

impl Default for ScaledDotProductAttention {
    fn default() -> Self {
        Self {
            config: Config::default(),
            dropout: Dropout::new(None, 0),
        }
    }
}

impl Attention for ScaledDotProductAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<AttentionOutput, AttentionError> {
        checks::expect_same_device("q", q, "k", k).map_err(AttentionError::from_check)?;
        checks::expect_same_device("q", q, "v", v).map_err(AttentionError::from_check)?;
        checks::expect_same_dtype("q", q, "k", k).map_err(AttentionError::from_check)?;
        checks::expect_same_dtype("q", q, "v", v).map_err(AttentionError::from_check)?;
        let dtype = q.dtype();
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16 | DType::F64) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let q_dims = q.dims();
        let k_dims = k.dims();
        let v_dims = v.dims();
        let rank = q_dims.len();
        if rank < 2 || k_dims.len() != rank || v_dims.len() != rank {
            return Err(AttentionError::shape(format!(
                "q, k, v must share a rank >= 2, got {q_dims:?}, {k_dims:?}, {v_dims:?}"
            )));
        }
        let lead = &q_dims[..rank - 2];
        let head_dim = q_dims[rank - 1];
        let k_len = k_dims[rank - 2];
        if k_len == 0 || q_dims[rank - 2] == 0 {
            return Err(AttentionError::shape(format!(
                "q and k need at least one position, got {q_dims:?} and {k_dims:?}"
            )));
        }
        if &k_dims[..rank - 2] != lead || k_dims[rank - 1] != head_dim {
            return Err(AttentionError::shape(format!(
                "k shape mismatch: expected {lead:?} + [?, {head_dim}] got {k_dims:?}"
            )));
        }
        if &v_dims[..rank - 2] != lead || v_dims[rank - 2] != k_len {
            return Err(AttentionError::shape(format!(
                "v shape mismatch: expected {lead:?} + [{k_len}, ?] got {v_dims:?}"
            )));
        }

        let policy = self.config.policy_for(dtype);
        let q_work = policy.cast_for_matmul(q)?.contiguous()?;
        let k_work = policy.cast_for_matmul(k)?;
        let v_work = policy.cast_for_matmul(v)?.contiguous()?;

        let k_t = k_work.transpose(rank - 2, rank - 1)?.contiguous()?;
        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = q_work.matmul(&k_t)?.affine(scale, 0.0)?;

        let probs = masked_softmax(&scores, mask)?;
        let probs = self.dropout.forward(&probs, &policy)?;
        let probs = policy.cast_for_matmul(&probs)?;
        let output = probs.matmul(&v_work)?;

        Ok(AttentionOutput {
            output: output.to_dtype(dtype)?,
            weights: probs.to_dtype(dtype)?,
        })
    }
}
