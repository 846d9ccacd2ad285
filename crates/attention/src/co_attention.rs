//! Parallel co-attention between a region stream and a sequence stream.
//!
//! `V` holds `region_count` column features per batch element laid out
//! `(batch, hidden_dim, region_count)`; `Q` holds `sequence_length` row
//! features laid out `(batch, sequence_length, hidden_dim)`. Each stream
//! attends over its own positions, guided by a bilinear affinity with the
//! other stream:
//!
//! ```text
//! C   = Q (W_b V)                              (batch, L, R)
//! H_v = tanh(W_v V + (W_q Q^T) C)              (batch, co, R)
//! H_q = tanh(W_q Q^T + (W_v V) C^T)            (batch, co, L)
//! a_v = softmax(w_hv^T H_v)                    (batch, 1, R)
//! a_q = softmax(w_hq^T H_q)                    (batch, 1, L)
//! v   = a_v V^T,  q = a_q Q                    (batch, hidden)
//! ```
//!
//! With `mask_in` enabled, padded positions of the raw scores are set to
//! `-inf` before the single softmax. A row without any valid position yields
//! NaN weights; callers must guarantee at least one valid position per row.
//! The batch axis is always kept, including for a batch of one.

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor, Var};
use layers::{checks, dtypes::PrecisionPolicy, Module};
use serde::Deserialize;

use crate::core::AttentionError;
use crate::masks::masked_softmax;

/// Dimensions and masking behaviour of [`ParallelCoAttention`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CoAttentionConfig {
    /// Feature width shared by `V` and `Q`.
    pub hidden_dim: usize,
    /// Width of the joint co-attention space.
    pub co_attention_dim: usize,
    /// Apply the validity masks passed to [`ParallelCoAttention::forward`].
    #[serde(default)]
    pub mask_in: bool,
}

impl CoAttentionConfig {
    pub fn new(hidden_dim: usize, co_attention_dim: usize) -> Self {
        Self {
            hidden_dim,
            co_attention_dim,
            mask_in: false,
        }
    }

    /// Enables masking of padded regions and sequence positions.
    pub fn with_masking(mut self) -> Self {
        self.mask_in = true;
        self
    }

    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.hidden_dim == 0 || self.co_attention_dim == 0 {
            return Err(AttentionError::InvalidConfig(format!(
                "co-attention dimensions must be non-zero, got hidden_dim={} co_attention_dim={}",
                self.hidden_dim, self.co_attention_dim
            )));
        }
        Ok(())
    }
}

/// Explicit parameter values, used to restore trained weights.
#[derive(Debug, Clone)]
pub struct CoAttentionWeights {
    /// `(hidden_dim, hidden_dim)`
    pub w_b: Tensor,
    /// `(co_attention_dim, hidden_dim)`
    pub w_v: Tensor,
    /// `(co_attention_dim, hidden_dim)`
    pub w_q: Tensor,
    /// `(co_attention_dim, 1)`
    pub w_hv: Tensor,
    /// `(co_attention_dim, 1)`
    pub w_hq: Tensor,
}

/// Attention weights and pooled features produced by one co-attention pass.
#[derive(Debug, Clone)]
pub struct CoAttentionOutput {
    /// `a_v`, `(batch, 1, region_count)`.
    pub region_weights: Tensor,
    /// `a_q`, `(batch, 1, sequence_length)`.
    pub sequence_weights: Tensor,
    /// `v`, `(batch, hidden_dim)`.
    pub pooled_regions: Tensor,
    /// `q`, `(batch, hidden_dim)`.
    pub pooled_sequence: Tensor,
}

/// Parallel co-attention network with learnable bilinear affinity.
#[derive(Debug, Clone)]
pub struct ParallelCoAttention {
    config: CoAttentionConfig,
    w_b: Var,
    w_v: Var,
    w_q: Var,
    w_hv: Var,
    w_hq: Var,
    first_call: OnceLock<()>,
}

impl ParallelCoAttention {
    /// Creates the module with every parameter drawn from `N(0, 1)`.
    pub fn new(config: CoAttentionConfig, device: &Device, dtype: DType) -> Result<Self, AttentionError> {
        config.validate()?;
        if !SUPPORTED_DTYPES.contains(&dtype) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("co_attention parameters: {dtype:?}"),
            });
        }
        let hidden = config.hidden_dim;
        let co = config.co_attention_dim;
        let normal = |shape: (usize, usize)| -> Result<Tensor, AttentionError> {
            Ok(Tensor::randn(0f32, 1.0, shape, device)?.to_dtype(dtype)?)
        };
        let weights = CoAttentionWeights {
            w_b: normal((hidden, hidden))?,
            w_v: normal((co, hidden))?,
            w_q: normal((co, hidden))?,
            w_hv: normal((co, 1))?,
            w_hq: normal((co, 1))?,
        };
        Self::from_weights(config, weights)
    }

    /// Creates the module from explicit parameter values.
    pub fn from_weights(
        config: CoAttentionConfig,
        weights: CoAttentionWeights,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let hidden = config.hidden_dim;
        let co = config.co_attention_dim;
        let expected: [(&str, &Tensor, [usize; 2]); 5] = [
            ("co_attention.w_b", &weights.w_b, [hidden, hidden]),
            ("co_attention.w_v", &weights.w_v, [co, hidden]),
            ("co_attention.w_q", &weights.w_q, [co, hidden]),
            ("co_attention.w_hv", &weights.w_hv, [co, 1]),
            ("co_attention.w_hq", &weights.w_hq, [co, 1]),
        ];
        for (context, tensor, dims) in expected {
            checks::expect_shape(context, tensor, &dims).map_err(AttentionError::from_check)?;
            checks::expect_dtype_in(context, tensor, SUPPORTED_DTYPES)
                .map_err(|err| AttentionError::UnsupportedDType {
                    requested: err.to_string(),
                })?;
            checks::expect_same_device(context, tensor, "co_attention.w_b", &weights.w_b)
                .map_err(AttentionError::from_check)?;
        }
        Ok(Self {
            config,
            w_b: Var::from_tensor(&weights.w_b)?,
            w_v: Var::from_tensor(&weights.w_v)?,
            w_q: Var::from_tensor(&weights.w_q)?,
            w_hv: Var::from_tensor(&weights.w_hv)?,
            w_hq: Var::from_tensor(&weights.w_hq)?,
            first_call: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &CoAttentionConfig {
        &self.config
    }

    /// Snapshot of the current parameter values.
    pub fn weights(&self) -> CoAttentionWeights {
        CoAttentionWeights {
            w_b: self.w_b.as_tensor().clone(),
            w_v: self.w_v.as_tensor().clone(),
            w_q: self.w_q.as_tensor().clone(),
            w_hv: self.w_hv.as_tensor().clone(),
            w_hq: self.w_hq.as_tensor().clone(),
        }
    }

    /// Runs co-attention over `regions` (`V`) and `sequence` (`Q`).
    ///
    /// Masks are `(batch, region_count)` and `(batch, sequence_length)` with
    /// non-zero marking valid positions. They are only applied when the
    /// configuration enables masking; an absent mask leaves that stream
    /// unmasked.
    pub fn forward(
        &self,
        regions: &Tensor,
        sequence: &Tensor,
        region_mask: Option<&Tensor>,
        sequence_mask: Option<&Tensor>,
    ) -> Result<CoAttentionOutput, AttentionError> {
        let (batch, region_count, seq_len) = self.validate_inputs(regions, sequence)?;
        let (region_mask, sequence_mask) = if self.config.mask_in {
            (region_mask, sequence_mask)
        } else {
            if region_mask.is_some() || sequence_mask.is_some() {
                log::debug!("co_attention masks ignored: masking is disabled");
            }
            (None, None)
        };
        if let Some(mask) = region_mask {
            checks::expect_shape("co_attention.region_mask", mask, &[batch, region_count])
                .map_err(AttentionError::from_check)?;
        }
        if let Some(mask) = sequence_mask {
            checks::expect_shape("co_attention.sequence_mask", mask, &[batch, seq_len])
                .map_err(AttentionError::from_check)?;
        }

        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::co_attention init hidden_dim={} co_attention_dim={} mask_in={} dtype={:?}",
                self.config.hidden_dim,
                self.config.co_attention_dim,
                self.config.mask_in,
                regions.dtype()
            );
        }
        log::debug!("co_attention forward batch={batch} regions={region_count} seq_len={seq_len}");

        let dtype = regions.dtype();
        let policy = PrecisionPolicy::from_parameter_dtype(dtype);
        let v = policy.cast_for_matmul(regions)?.contiguous()?;
        let q = policy.cast_for_matmul(sequence)?.contiguous()?;
        let q_t = q.transpose(1, 2)?.contiguous()?;
        let w_b = policy.cast_for_matmul(self.w_b.as_tensor())?;
        let w_v = policy.cast_for_matmul(self.w_v.as_tensor())?;
        let w_q = policy.cast_for_matmul(self.w_q.as_tensor())?;
        let w_hv_t = policy.cast_for_matmul(self.w_hv.as_tensor())?.t()?.contiguous()?;
        let w_hq_t = policy.cast_for_matmul(self.w_hq.as_tensor())?.t()?.contiguous()?;

        // (batch, L, R)
        let affinity = q.matmul(&w_b.broadcast_matmul(&v)?)?;
        let affinity_t = affinity.transpose(1, 2)?.contiguous()?;
        // (batch, co, R) and (batch, co, L)
        let projected_v = w_v.broadcast_matmul(&v)?;
        let projected_q = w_q.broadcast_matmul(&q_t)?;

        let hidden_v = projected_v.add(&projected_q.matmul(&affinity)?)?.tanh()?;
        let hidden_q = projected_q.add(&projected_v.matmul(&affinity_t)?)?.tanh()?;

        let region_scores = w_hv_t.broadcast_matmul(&hidden_v)?;
        let sequence_scores = w_hq_t.broadcast_matmul(&hidden_q)?;
        let region_weights = masked_softmax(&region_scores, region_mask)?;
        let sequence_weights = masked_softmax(&sequence_scores, sequence_mask)?;

        let v_t = v.transpose(1, 2)?.contiguous()?;
        let pooled_regions = region_weights.matmul(&v_t)?.squeeze(1)?;
        let pooled_sequence = sequence_weights.matmul(&q)?.squeeze(1)?;

        Ok(CoAttentionOutput {
            region_weights: region_weights.to_dtype(dtype)?,
            sequence_weights: sequence_weights.to_dtype(dtype)?,
            pooled_regions: policy.cast_to_storage(&pooled_regions)?,
            pooled_sequence: policy.cast_to_storage(&pooled_sequence)?,
        })
    }

    /// Checks layouts, dtypes and devices; returns `(batch, region_count, seq_len)`.
    fn validate_inputs(
        &self,
        regions: &Tensor,
        sequence: &Tensor,
    ) -> Result<(usize, usize, usize), AttentionError> {
        let hidden = self.config.hidden_dim;
        let (batch, region_count) = match regions.dims() {
            [batch, h, r] if *h == hidden => (*batch, *r),
            dims => {
                return Err(AttentionError::shape(format!(
                    "co_attention.regions: expected (batch, {hidden}, region_count), got {dims:?}"
                )))
            }
        };
        let (seq_batch, seq_len) = checks::expect_batch_seq_hidden("co_attention.sequence", sequence, hidden)
            .map_err(AttentionError::from_check)?;
        if seq_batch != batch {
            return Err(AttentionError::shape(format!(
                "co_attention: regions batch {batch} does not match sequence batch {seq_batch}"
            )));
        }
        if region_count == 0 || seq_len == 0 {
            return Err(AttentionError::shape(format!(
                "co_attention: region_count ({region_count}) and sequence_length ({seq_len}) must be non-zero"
            )));
        }
        for (context, tensor) in [("co_attention.regions", regions), ("co_attention.sequence", sequence)] {
            if !SUPPORTED_DTYPES.contains(&tensor.dtype()) {
                return Err(AttentionError::UnsupportedDType {
                    requested: format!("{context}: {:?}", tensor.dtype()),
                });
            }
        }
        checks::expect_same_dtype("co_attention.regions", regions, "co_attention.sequence", sequence)
            .map_err(AttentionError::from_check)?;
        checks::expect_same_device("co_attention.regions", regions, "co_attention.sequence", sequence)
            .map_err(AttentionError::from_check)?;
        checks::expect_same_device("co_attention.regions", regions, "co_attention.w_b", self.w_b.as_tensor())
            .map_err(AttentionError::from_check)?;
        Ok((batch, region_count, seq_len))
    }
}

const SUPPORTED_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32];

impl Module for ParallelCoAttention {
    /// `[W_b, W_v, W_q, w_hv, w_hq]`
    fn parameters(&self) -> Vec<Var> {
        vec![
            self.w_b.clone(),
            self.w_v.clone(),
            self.w_q.clone(),
            self.w_hv.clone(),
            self.w_hq.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::validity_from_lengths;

    fn weights(hidden: usize, co: usize, device: &Device) -> candle_core::Result<CoAttentionWeights> {
        let ramp = |rows: usize, cols: usize, offset: f32| -> candle_core::Result<Tensor> {
            let data: Vec<f32> = (0..rows * cols)
                .map(|i| ((i as f32 + offset) * 0.37).sin() * 0.5)
                .collect();
            Tensor::from_vec(data, (rows, cols), device)
        };
        Ok(CoAttentionWeights {
            w_b: ramp(hidden, hidden, 0.0)?,
            w_v: ramp(co, hidden, 1.0)?,
            w_q: ramp(co, hidden, 2.0)?,
            w_hv: ramp(co, 1, 3.0)?,
            w_hq: ramp(co, 1, 4.0)?,
        })
    }

    fn inputs(batch: usize, hidden: usize, regions: usize, seq: usize, device: &Device) -> candle_core::Result<(Tensor, Tensor)> {
        let v: Vec<f32> = (0..batch * hidden * regions).map(|i| (i as f32 * 0.13).cos()).collect();
        let q: Vec<f32> = (0..batch * seq * hidden).map(|i| (i as f32 * 0.29).sin()).collect();
        Ok((
            Tensor::from_vec(v, (batch, hidden, regions), device)?,
            Tensor::from_vec(q, (batch, seq, hidden), device)?,
        ))
    }

    fn matmul(a: &[f64], b: &[f64], n: usize, k: usize, m: usize) -> Vec<f64> {
        let mut out = vec![0.0; n * m];
        for i in 0..n {
            for j in 0..m {
                out[i * m + j] = (0..k).map(|p| a[i * k + p] * b[p * m + j]).sum();
            }
        }
        out
    }

    fn transpose(a: &[f64], rows: usize, cols: usize) -> Vec<f64> {
        let mut out = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                out[j * rows + i] = a[i * cols + j];
            }
        }
        out
    }

    fn softmax(scores: &[f64]) -> Vec<f64> {
        let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
        let total: f64 = exps.iter().sum();
        exps.iter().map(|e| e / total).collect()
    }

    fn flat(t: &Tensor) -> candle_core::Result<Vec<f64>> {
        t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()
    }

    /// Single batch element computed with plain loops: `(a_v, a_q, v, q)`.
    fn naive(
        w: &CoAttentionWeights,
        v: &[f64],
        q: &[f64],
        hidden: usize,
        co: usize,
        regions: usize,
        seq: usize,
    ) -> candle_core::Result<[Vec<f64>; 4]> {
        let (w_b, w_v, w_q) = (flat(&w.w_b)?, flat(&w.w_v)?, flat(&w.w_q)?);
        let (w_hv, w_hq) = (flat(&w.w_hv)?, flat(&w.w_hq)?);
        let q_t = transpose(q, seq, hidden);
        let c = matmul(q, &matmul(&w_b, v, hidden, hidden, regions), seq, hidden, regions);
        let wv_v = matmul(&w_v, v, co, hidden, regions);
        let wq_qt = matmul(&w_q, &q_t, co, hidden, seq);
        let h_v: Vec<f64> = wv_v
            .iter()
            .zip(matmul(&wq_qt, &c, co, seq, regions))
            .map(|(a, b)| (a + b).tanh())
            .collect();
        let h_q: Vec<f64> = wq_qt
            .iter()
            .zip(matmul(&wv_v, &transpose(&c, seq, regions), co, regions, seq))
            .map(|(a, b)| (a + b).tanh())
            .collect();
        let a_v = softmax(&matmul(&w_hv, &h_v, 1, co, regions));
        let a_q = softmax(&matmul(&w_hq, &h_q, 1, co, seq));
        let pooled_v = matmul(&a_v, &transpose(v, hidden, regions), 1, regions, hidden);
        let pooled_q = matmul(&a_q, q, 1, seq, hidden);
        Ok([a_v, a_q, pooled_v, pooled_q])
    }

    fn assert_close(got: &[f64], want: &[f64], tol: f64) {
        assert_eq!(got.len(), want.len());
        for (g, w) in got.iter().zip(want) {
            assert!((g - w).abs() < tol, "got {got:?}, want {want:?}");
        }
    }

    #[test]
    fn scenario_shapes_and_row_sums() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let module = ParallelCoAttention::new(CoAttentionConfig::new(4, 2), &device, DType::F32)?;
        let (v, q) = inputs(1, 4, 3, 2, &device)?;
        let out = module.forward(&v, &q, None, None)?;
        assert_eq!(out.region_weights.dims(), &[1, 1, 3]);
        assert_eq!(out.sequence_weights.dims(), &[1, 1, 2]);
        assert_eq!(out.pooled_regions.dims(), &[1, 4]);
        assert_eq!(out.pooled_sequence.dims(), &[1, 4]);
        for weights in [&out.region_weights, &out.sequence_weights] {
            let row = weights.flatten_all()?.to_vec1::<f32>()?;
            assert!(row.iter().all(|w| *w >= 0.0));
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn masked_region_gets_zero_weight() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let module = ParallelCoAttention::from_weights(
            CoAttentionConfig::new(4, 2).with_masking(),
            weights(4, 2, &device)?,
        )?;
        let (v, q) = inputs(1, 4, 3, 2, &device)?;
        let v_mask = Tensor::new(&[[1u8, 1, 0]], &device)?;
        let out = module.forward(&v, &q, Some(&v_mask), None)?;
        let a_v = out.region_weights.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a_v[2], 0.0);
        assert!((a_v[0] + a_v[1] - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn matches_loop_reference() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let (hidden, co, regions, seq) = (3, 2, 4, 5);
        let w = weights(hidden, co, &device)?;
        let module = ParallelCoAttention::from_weights(CoAttentionConfig::new(hidden, co), w.clone())?;
        let (v, q) = inputs(2, hidden, regions, seq, &device)?;
        let out = module.forward(&v, &q, None, None)?;

        for b in 0..2 {
            let want = naive(&w, &flat(&v.get(b)?)?, &flat(&q.get(b)?)?, hidden, co, regions, seq)?;
            let got = [
                &out.region_weights,
                &out.sequence_weights,
                &out.pooled_regions,
                &out.pooled_sequence,
            ];
            for (tensor, expected) in got.iter().zip(want.iter()) {
                assert_close(&flat(&tensor.get(b)?)?, expected, 1e-4);
            }
        }
        Ok(())
    }

    #[test]
    fn masks_are_ignored_unless_enabled() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let w = weights(4, 2, &device)?;
        let plain = ParallelCoAttention::from_weights(CoAttentionConfig::new(4, 2), w)?;
        let (v, q) = inputs(2, 4, 3, 2, &device)?;
        let v_mask = validity_from_lengths(&device, &[1, 2], 3)?;
        let q_mask = validity_from_lengths(&device, &[1, 1], 2)?;
        let with_masks = plain.forward(&v, &q, Some(&v_mask), Some(&q_mask))?;
        let without = plain.forward(&v, &q, None, None)?;
        assert_eq!(
            flat(&with_masks.region_weights)?,
            flat(&without.region_weights)?
        );
        Ok(())
    }

    #[test]
    fn masked_pooling_only_uses_valid_positions() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let module = ParallelCoAttention::from_weights(
            CoAttentionConfig::new(4, 3).with_masking(),
            weights(4, 3, &device)?,
        )?;
        let (v, q) = inputs(2, 4, 5, 3, &device)?;
        let v_mask = validity_from_lengths(&device, &[5, 1], 5)?;
        let q_mask = validity_from_lengths(&device, &[1, 3], 3)?;
        let out = module.forward(&v, &q, Some(&v_mask), Some(&q_mask))?;

        // A single valid region pools to that region's column.
        let pooled = flat(&out.pooled_regions.get(1)?)?;
        let column = flat(&v.get(1)?.narrow(1, 0, 1)?)?;
        assert_close(&pooled, &column, 1e-6);
        let pooled = flat(&out.pooled_sequence.get(0)?)?;
        let row = flat(&q.get(0)?.get(0)?)?;
        assert_close(&pooled, &row, 1e-6);
        Ok(())
    }

    #[test]
    fn fully_masked_row_is_nan() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let module = ParallelCoAttention::new(CoAttentionConfig::new(4, 2).with_masking(), &device, DType::F32)?;
        let (v, q) = inputs(1, 4, 3, 2, &device)?;
        let v_mask = Tensor::zeros((1, 3), DType::U8, &device)?;
        let out = module.forward(&v, &q, Some(&v_mask), None)?;
        let a_v = out.region_weights.flatten_all()?.to_vec1::<f32>()?;
        assert!(a_v.iter().all(|w| w.is_nan()));
        Ok(())
    }

    #[test]
    fn deterministic_for_fixed_inputs() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let module = ParallelCoAttention::new(CoAttentionConfig::new(6, 4), &device, DType::F32)?;
        let (v, q) = inputs(3, 6, 7, 2, &device)?;
        let first = module.forward(&v, &q, None, None)?;
        let second = module.forward(&v, &q, None, None)?;
        assert_eq!(flat(&first.pooled_regions)?, flat(&second.pooled_regions)?);
        assert_eq!(flat(&first.sequence_weights)?, flat(&second.sequence_weights)?);
        Ok(())
    }

    #[test]
    fn half_precision_inputs_keep_their_dtype() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let module = ParallelCoAttention::new(CoAttentionConfig::new(4, 2), &device, DType::BF16)?;
        let (v, q) = inputs(2, 4, 3, 5, &device)?;
        let out = module.forward(&v.to_dtype(DType::BF16)?, &q.to_dtype(DType::BF16)?, None, None)?;
        assert_eq!(out.region_weights.dtype(), DType::BF16);
        assert_eq!(out.pooled_sequence.dtype(), DType::BF16);
        let sums = out.sequence_weights.to_dtype(DType::F32)?.sum(2)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-2));
        Ok(())
    }

    #[test]
    fn shape_errors_are_descriptive() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let module = ParallelCoAttention::new(CoAttentionConfig::new(4, 2).with_masking(), &device, DType::F32)?;
        let (v, q) = inputs(2, 4, 3, 2, &device)?;

        let wrong_hidden = Tensor::zeros((2, 5, 3), DType::F32, &device)?;
        let err = module.forward(&wrong_hidden, &q, None, None).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));

        let wrong_batch = Tensor::zeros((1, 2, 4), DType::F32, &device)?;
        assert!(matches!(
            module.forward(&v, &wrong_batch, None, None).unwrap_err(),
            AttentionError::InvalidShape { .. }
        ));

        let wrong_mask = validity_from_lengths(&device, &[3, 3], 4)?;
        assert!(matches!(
            module.forward(&v, &q, Some(&wrong_mask), None).unwrap_err(),
            AttentionError::InvalidShape { .. }
        ));

        let ints = Tensor::zeros((2, 4, 3), DType::I64, &device)?;
        assert!(matches!(
            module.forward(&ints, &q, None, None).unwrap_err(),
            AttentionError::UnsupportedDType { .. }
        ));
        Ok(())
    }

    #[test]
    fn empty_regions_or_sequence_are_rejected() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let module = ParallelCoAttention::new(CoAttentionConfig::new(4, 2), &device, DType::F32)?;
        let (v, q) = inputs(1, 4, 3, 2, &device)?;

        let no_regions = Tensor::zeros((1, 4, 0), DType::F32, &device)?;
        assert!(matches!(
            module.forward(&no_regions, &q, None, None).unwrap_err(),
            AttentionError::InvalidShape { .. }
        ));

        let no_tokens = Tensor::zeros((1, 0, 4), DType::F32, &device)?;
        assert!(matches!(
            module.forward(&v, &no_tokens, None, None).unwrap_err(),
            AttentionError::InvalidShape { .. }
        ));
        Ok(())
    }

    #[test]
    fn parameters_follow_declared_shapes() -> Result<(), AttentionError> {
        let module = ParallelCoAttention::new(CoAttentionConfig::new(5, 3), &Device::Cpu, DType::F32)?;
        let dims: Vec<Vec<usize>> = module
            .parameters()
            .iter()
            .map(|p| p.as_tensor().dims().to_vec())
            .collect();
        assert_eq!(dims, vec![vec![5, 5], vec![3, 5], vec![3, 5], vec![3, 1], vec![3, 1]]);
        assert!(ParallelCoAttention::new(CoAttentionConfig::new(0, 3), &Device::Cpu, DType::F32).is_err());
        Ok(())
    }
}
