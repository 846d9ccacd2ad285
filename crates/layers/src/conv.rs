//! Multi-width 1-D convolutional feature extractor.
//!
//! Input is `(batch, seq, input_dim)`. Each configured kernel runs a valid
//! (unpadded) convolution along the sequence axis, the response is max-pooled
//! over time, and the per-kernel features are concatenated into
//! `(batch, sum(channels))`. Kernels are applied in configuration order.

use candle_core::{DType, Device, Error, Result, Tensor, Var, D};
use serde::Deserialize;

use crate::{checks, dtypes::PrecisionPolicy, LayerError, Module};

/// One convolution branch: kernel width and number of output channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct KernelSpec {
    pub width: usize,
    pub channels: usize,
}

struct Conv1dBranch {
    spec: KernelSpec,
    weight: Var,
    bias: Var,
}

/// Text-CNN style extractor.
pub struct CnnExtractor {
    input_dim: usize,
    branches: Vec<Conv1dBranch>,
}

impl std::fmt::Debug for CnnExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let specs: Vec<KernelSpec> = self.branches.iter().map(|b| b.spec).collect();
        f.debug_struct("CnnExtractor")
            .field("input_dim", &self.input_dim)
            .field("kernels", &specs)
            .finish()
    }
}

impl CnnExtractor {
    /// Builds one convolution per kernel spec with `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` init.
    pub fn new(
        kernels: &[KernelSpec],
        input_dim: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if kernels.is_empty() {
            return Err(LayerError::InvalidConfig("cnn extractor needs at least one kernel".into()).into());
        }
        let mut branches = Vec::with_capacity(kernels.len());
        for spec in kernels {
            if spec.width == 0 || spec.channels == 0 {
                return Err(LayerError::InvalidConfig(format!(
                    "kernel width and channels must be non-zero, got {spec:?}"
                ))
                .into());
            }
            let bound = 1.0 / ((input_dim * spec.width) as f64).sqrt();
            let weight = Tensor::rand(
                -bound as f32,
                bound as f32,
                (spec.channels, input_dim, spec.width),
                device,
            )?
            .to_dtype(dtype)?;
            let bias = Tensor::rand(-bound as f32, bound as f32, spec.channels, device)?
                .to_dtype(dtype)?;
            branches.push(Conv1dBranch {
                spec: *spec,
                weight: Var::from_tensor(&weight)?,
                bias: Var::from_tensor(&bias)?,
            });
        }
        log::debug!("cnn extractor built input_dim={input_dim} kernels={kernels:?}");
        Ok(Self {
            input_dim,
            branches,
        })
    }

    /// Width of the concatenated output features.
    pub fn output_dim(&self) -> usize {
        self.branches.iter().map(|b| b.spec.channels).sum()
    }

    /// Extracts `(batch, output_dim)` features from `(batch, seq, input_dim)`.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let (_, seq) = checks::expect_batch_seq_hidden("cnn.input", input, self.input_dim)?;
        let channels_first = policy.cast_for_matmul(input)?.transpose(1, 2)?.contiguous()?;

        let mut features = Vec::with_capacity(self.branches.len());
        for branch in &self.branches {
            if seq < branch.spec.width {
                return Err(Error::Msg(format!(
                    "cnn.input: sequence length {seq} shorter than kernel width {}",
                    branch.spec.width
                )));
            }
            let weight = policy.cast_for_matmul(branch.weight.as_tensor())?;
            let bias = policy
                .cast_for_matmul(branch.bias.as_tensor())?
                .reshape((1, branch.spec.channels, 1))?;
            let response = channels_first
                .conv1d(&weight, 0, 1, 1, 1)?
                .broadcast_add(&bias)?;
            features.push(response.max(D::Minus1)?);
        }

        policy.cast_to_storage(&Tensor::cat(&features, 1)?)
    }
}

impl Module for CnnExtractor {
    fn parameters(&self) -> Vec<Var> {
        self.branches
            .iter()
            .flat_map(|b| [b.weight.clone(), b.bias.clone()])
            .collect()
    }
}
