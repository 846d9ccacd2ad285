//! Multi-head attention with key padding masks.
//!
//! Inputs are batch-first: `query` is `(batch, q_len, embed_dim)`, `key` and
//! `value` are `(batch, k_len, embed_dim)`. Each is projected, split into
//! `num_heads` heads of `embed_dim / num_heads` features, attended with
//! [`ScaledDotProductAttention`], merged back and passed through an output
//! projection. Key padding masks are `(batch, k_len)` validity masks and apply
//! to every head and query.

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor, Var};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    Module,
};
use serde::Deserialize;

use crate::core::{Attention, AttentionError, AttentionOutput, Config};
use crate::reference::ScaledDotProductAttention;

/// Shape and behaviour of a [`MultiHeadAttention`] block.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MultiHeadConfig {
    /// Model width shared by queries, keys, values and the output.
    pub embed_dim: usize,
    /// Number of heads; must divide `embed_dim`.
    pub num_heads: usize,
    /// Dropout and precision settings for the attention kernel.
    #[serde(default)]
    pub attention: Config,
}

impl MultiHeadConfig {
    pub fn new(embed_dim: usize, num_heads: usize) -> Self {
        Self {
            embed_dim,
            num_heads,
            attention: Config::default(),
        }
    }

    /// Sets the attention dropout probability.
    pub fn with_dropout(mut self, dropout_p: f32) -> Self {
        self.attention.dropout_p = Some(dropout_p);
        self
    }

    /// Width of each head.
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads.max(1)
    }

    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.embed_dim == 0 || self.num_heads == 0 {
            return Err(AttentionError::InvalidConfig(
                "embed_dim and num_heads must be greater than zero".into(),
            ));
        }
        if self.embed_dim % self.num_heads != 0 {
            return Err(AttentionError::InvalidConfig(format!(
                "embed_dim ({}) must be divisible by num_heads ({})",
                self.embed_dim, self.num_heads
            )));
        }
        self.attention.validate()
    }
}

/// Multi-head attention with separate query/key/value projections.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    config: MultiHeadConfig,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    kernel: ScaledDotProductAttention,
    first_call: OnceLock<()>,
}

impl MultiHeadAttention {
    /// Builds the block with Xavier-uniform projections and zero biases.
    pub fn new(
        config: MultiHeadConfig,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let projection = || {
            Linear::with_init(
                LinearConfig::new(config.embed_dim, config.embed_dim),
                &LinearInit::XavierUniform,
                device,
                dtype,
            )
        };
        Ok(Self {
            q_proj: projection()?,
            k_proj: projection()?,
            v_proj: projection()?,
            out_proj: projection()?,
            kernel: ScaledDotProductAttention::new(config.attention.clone(), seed)?,
            first_call: OnceLock::new(),
            config,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &MultiHeadConfig {
        &self.config
    }

    /// Projections in `query, key, value, output` order.
    pub fn projections(&self) -> [&Linear; 4] {
        [&self.q_proj, &self.k_proj, &self.v_proj, &self.out_proj]
    }

    fn split_heads(&self, tensor: &Tensor, batch: usize, len: usize) -> Result<Tensor, AttentionError> {
        let heads = tensor
            .reshape((batch, len, self.config.num_heads, self.config.head_dim()))?
            .transpose(1, 2)?
            .contiguous()?;
        Ok(heads)
    }

    /// Attends `query` to `key`/`value`, masking padded keys.
    ///
    /// Returns the projected output `(batch, q_len, embed_dim)` and per-head
    /// weights `(batch, num_heads, q_len, k_len)`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_valid: Option<&Tensor>,
    ) -> Result<AttentionOutput, AttentionError> {
        let embed = self.config.embed_dim;
        let (batch, q_len) = checks::expect_batch_seq_hidden("mha.query", query, embed)
            .map_err(AttentionError::from_check)?;
        let (k_batch, k_len) = checks::expect_batch_seq_hidden("mha.key", key, embed)
            .map_err(AttentionError::from_check)?;
        checks::expect_shape("mha.value", value, key.dims()).map_err(AttentionError::from_check)?;
        if k_batch != batch {
            return Err(AttentionError::shape(format!(
                "query batch {batch} does not match key batch {k_batch}"
            )));
        }
        if let Some(mask) = key_valid {
            checks::expect_shape("mha.key_valid", mask, &[batch, k_len])
                .map_err(AttentionError::from_check)?;
        }

        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::multi_head init embed_dim={} heads={} dropout={:?} precision={:?}",
                embed,
                self.config.num_heads,
                self.config.attention.dropout_p,
                self.config.attention.precision
            );
        }
        log::debug!("mha forward batch={batch} q_len={q_len} k_len={k_len}");

        let policy: PrecisionPolicy = self.config.attention.policy_for(query.dtype());
        let q = self.split_heads(&self.q_proj.forward(query, &policy)?, batch, q_len)?;
        let k = self.split_heads(&self.k_proj.forward(key, &policy)?, batch, k_len)?;
        let v = self.split_heads(&self.v_proj.forward(value, &policy)?, batch, k_len)?;

        let attended = self.kernel.attend(&q, &k, &v, key_valid)?;
        let merged = attended
            .output
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, q_len, embed))?;
        Ok(AttentionOutput {
            output: self.out_proj.forward(&merged, &policy)?,
            weights: attended.weights,
        })
    }

    /// Self-attention over `input`.
    pub fn forward_self(
        &self,
        input: &Tensor,
        valid: Option<&Tensor>,
    ) -> Result<AttentionOutput, AttentionError> {
        self.forward(input, input, input, valid)
    }
}

impl Module for MultiHeadAttention {
    fn parameters(&self) -> Vec<Var> {
        self.projections()
            .into_iter()
            .flat_map(Module::parameters)
            .collect()
    }

    fn set_training(&self, training: bool) {
        self.kernel.set_training(training);
    }
}

/// Attends a query stream over a feature stream with multi-head attention.
///
/// Keys and values come from `inputs`; `mask` marks valid positions of
/// `inputs`.
#[derive(Debug, Clone)]
pub struct SelfAttentionFeatureExtract {
    attention: MultiHeadAttention,
}

impl SelfAttentionFeatureExtract {
    /// `num_heads` heads over `input_size` features with attention dropout 0.1.
    pub fn new(
        num_heads: usize,
        input_size: usize,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        let config = MultiHeadConfig::new(input_size, num_heads).with_dropout(0.1);
        Ok(Self {
            attention: MultiHeadAttention::new(config, seed, device, dtype)?,
        })
    }

    /// Returns `(features (batch, q_len, input_size), weights (batch, heads, q_len, k_len))`.
    pub fn forward(
        &self,
        inputs: &Tensor,
        query: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        let out = self.attention.forward(query, inputs, inputs, mask)?;
        Ok((out.output, out.weights))
    }
}

impl Module for SelfAttentionFeatureExtract {
    fn parameters(&self) -> Vec<Var> {
        self.attention.parameters()
    }

    fn set_training(&self, training: bool) {
        self.attention.set_training(training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::validity_from_lengths;
    use layers::parameter_count;

    #[test]
    fn output_and_weight_shapes() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let mha = MultiHeadAttention::new(MultiHeadConfig::new(8, 2), 0, &device, DType::F32)?;
        let query = Tensor::randn(0f32, 1.0, (3, 4, 8), &device)?;
        let memory = Tensor::randn(0f32, 1.0, (3, 6, 8), &device)?;
        let out = mha.forward(&query, &memory, &memory, None)?;
        assert_eq!(out.output.dims(), &[3, 4, 8]);
        assert_eq!(out.weights.dims(), &[3, 2, 4, 6]);
        assert_eq!(parameter_count(&mha), 4 * (8 * 8 + 8));
        Ok(())
    }

    #[test]
    fn padded_keys_receive_no_weight() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let mha = MultiHeadAttention::new(MultiHeadConfig::new(4, 2), 0, &device, DType::F32)?;
        let query = Tensor::randn(0f32, 1.0, (2, 3, 4), &device)?;
        let memory = Tensor::randn(0f32, 1.0, (2, 5, 4), &device)?;
        let valid = validity_from_lengths(&device, &[5, 2], 5)?;
        let out = mha.forward(&query, &memory, &memory, Some(&valid))?;

        let second = out.weights.get(1)?.flatten_all()?.to_vec1::<f32>()?;
        for row in second.chunks(5) {
            assert!(row[2..].iter().all(|w| *w == 0.0));
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn indivisible_heads_are_rejected() {
        let err = MultiHeadAttention::new(MultiHeadConfig::new(10, 3), 0, &Device::Cpu, DType::F32)
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidConfig(_)));
    }

    #[test]
    fn feature_extract_uses_inputs_as_memory() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let extract = SelfAttentionFeatureExtract::new(2, 8, 0, &device, DType::F32)?;
        extract.set_training(false);
        let inputs = Tensor::randn(0f32, 1.0, (2, 7, 8), &device)?;
        let query = Tensor::randn(0f32, 1.0, (2, 3, 8), &device)?;
        let mask = validity_from_lengths(&device, &[7, 4], 7)?;
        let (features, weights) = extract.forward(&inputs, &query, Some(&mask))?;
        assert_eq!(features.dims(), &[2, 3, 8]);
        assert_eq!(weights.dims(), &[2, 2, 3, 7]);
        Ok(())
    }

    #[test]
    fn gradients_reach_every_projection() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let mha = MultiHeadAttention::new(MultiHeadConfig::new(6, 2), 3, &device, DType::F32)?;
        mha.set_training(false);
        let query = Tensor::randn(0f32, 1.0, (2, 3, 6), &device)?;
        let memory = Tensor::randn(0f32, 1.0, (2, 5, 6), &device)?;
        let valid = validity_from_lengths(&device, &[5, 3], 5)?;
        let out = mha.forward(&query, &memory, &memory, Some(&valid))?;
        let grads = out.output.sqr()?.sum_all()?.backward()?;

        // [q_w, q_b, k_w, k_b, v_w, v_b, o_w, o_b]
        for (index, param) in mha.parameters().iter().enumerate() {
            let grad = grads
                .get(param.as_tensor())
                .unwrap_or_else(|| panic!("missing gradient for parameter {index}"));
            let values = grad.flatten_all()?.to_vec1::<f32>()?;
            assert!(values.iter().all(|g| g.is_finite()));
            // the key bias adds the same score to every key of a query row
            if index != 3 {
                assert!(values.iter().any(|g| *g != 0.0), "parameter {index} has a zero gradient");
            }
        }
        Ok(())
    }
}
