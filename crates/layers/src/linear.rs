//! Linear and affine projection helpers.
//!
//! Inputs may have any rank as long as the feature axis is last: `(in,)`,
//! `(batch, in)`, `(batch, seq, in)` and so on. Leading axes are flattened for
//! the matmul and restored afterwards, so the output keeps the input layout
//! with `out_dim` features. Weights and activations are promoted to
//! [`PrecisionPolicy::compute`] before the matmul and the result is cast back
//! with [`PrecisionPolicy::cast_to_storage`].

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use serde::Deserialize;

use crate::{checks, dtypes::PrecisionPolicy, Module};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    #[serde(default = "default_bias")]
    pub bias: bool,
}

fn default_bias() -> bool {
    true
}

impl LinearConfig {
    /// Creates a configuration for a single projection layer with bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    /// Same projection without a bias term.
    pub fn without_bias(mut self) -> Self {
        self.bias = false;
        self
    }
}

/// Shared interface for affine projections.
pub trait LinearLayer: Send + Sync {
    /// Returns the static configuration used to validate inputs.
    fn config(&self) -> &LinearConfig;

    /// Applies the linear projection, promoting to the compute dtype when needed.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Supported weight initialisation policies.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Xavier/Glorot normal initialisation.
    XavierNormal,
    /// Kaiming/He uniform initialisation.
    KaimingUniform { negative_slope: f64 },
    /// Kaiming/He normal initialisation.
    KaimingNormal { negative_slope: f64 },
    /// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` for both weight and bias.
    TorchDefault,
    /// Scales another policy.
    Scaled { base: Box<LinearInit>, scale: f64 },
}

impl LinearInit {
    /// Convenience helper to scale an existing policy.
    pub fn scaled(base: LinearInit, scale: f64) -> Self {
        Self::Scaled {
            base: Box::new(base),
            scale,
        }
    }

    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let weight_f32 = match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::XavierNormal => {
                let std = (2.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::randn(0f32, std as f32, shape, device)?
            }
            LinearInit::KaimingUniform { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = (3.0f64).sqrt() * gain / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::KaimingNormal { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let std = gain / fan_in.sqrt();
                Tensor::randn(0f32, std as f32, shape, device)?
            }
            LinearInit::TorchDefault => {
                let bound = 1.0 / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::Scaled { base, scale } => {
                let sampled = base.sample(shape, device, DType::F32)?;
                sampled.affine(*scale, 0.0)?
            }
        };
        if dtype == DType::F32 {
            Ok(weight_f32)
        } else {
            checks::ensure_cast_supported("linear.init", DType::F32, dtype)?;
            weight_f32.to_dtype(dtype)
        }
    }

    fn sample_bias(&self, config: &LinearConfig, device: &Device, dtype: DType) -> Result<Tensor> {
        match self {
            LinearInit::TorchDefault => {
                let bound = 1.0 / (config.input_dim as f64).sqrt();
                Tensor::rand(-bound as f32, bound as f32, config.output_dim, device)?
                    .to_dtype(dtype)
            }
            _ => Tensor::zeros(config.output_dim, dtype, device),
        }
    }
}

/// Dense affine projection with optional bias and mixed-precision aware forward pass.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    ///
    /// `weight` is laid out `(output_dim, input_dim)` and `bias` `(output_dim,)`.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
            bias: bias.as_ref().map(Var::from_tensor).transpose()?,
        })
    }

    /// Builds a linear layer with randomly initialised weights following `init`.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.output_dim, config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(init.sample_bias(&config, device, dtype)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Returns the weight tensor (shares storage with the parameter).
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    /// Returns the bias tensor if present.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref().map(Var::as_tensor)
    }

    /// Overwrites the weight parameter in place.
    pub fn copy_weight_from(&self, value: &Tensor) -> Result<()> {
        Self::validate_weight(&self.config, value)?;
        self.weight.set(&value.to_dtype(self.weight.dtype())?)
    }

    /// Overwrites the bias parameter in place.
    pub fn copy_bias_from(&self, value: &Tensor) -> Result<()> {
        match &self.bias {
            Some(bias) => {
                Self::validate_bias(&self.config, Some(value))?;
                bias.set(&value.to_dtype(bias.dtype())?)
            }
            None => Err(Error::Msg("layer has no bias to copy into".into())),
        }
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", weight, checks::FLOAT_DTYPES)
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_dtype_in("linear.bias", tensor, checks::FLOAT_DTYPES)
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        match hidden.dims().last() {
            Some(&last) if last == self.config.input_dim => Ok(()),
            Some(&last) => Err(Error::Msg(format!(
                "linear.input: expected last dim {} but received {}",
                self.config.input_dim, last
            ))),
            None => Err(Error::Msg("linear.input: scalar inputs are not supported".into())),
        }
    }
}

impl LinearLayer for Linear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.validate_input(hidden)?;

        let input = policy.cast_for_matmul(hidden)?;
        let weight = policy.cast_for_matmul(self.weight.as_tensor())?;

        let mut out_dims = input.dims().to_vec();
        let rows = input.elem_count() / self.config.input_dim;
        if let Some(last) = out_dims.last_mut() {
            *last = self.config.output_dim;
        }

        let flat = input.reshape((rows, self.config.input_dim))?;
        let mut output = flat.matmul(&weight.t()?)?;
        if let Some(bias) = &self.bias {
            let bias = policy.cast_for_matmul(bias.as_tensor())?;
            output = output.broadcast_add(&bias)?;
        }

        policy.cast_to_storage(&output.reshape(out_dims)?)
    }
}

impl Module for Linear {
    fn parameters(&self) -> Vec<Var> {
        let mut params = vec![self.weight.clone()];
        params.extend(self.bias.iter().cloned());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtypes::PrecisionPolicy;
    use candle_core::{DType, Device};

    fn reference_linear(input: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let (batch, seq, hidden) = input.dims3()?;
        input
            .reshape((batch * seq, hidden))?
            .matmul(&weight.t()?)?
            .broadcast_add(bias)?
            .reshape((batch, seq, weight.dims()[0]))
    }

    fn tensor_stats(tensor: &Tensor) -> Result<(f64, f64)> {
        let values = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let mean = values.iter().copied().map(f64::from).sum::<f64>() / values.len() as f64;
        let var = values
            .iter()
            .map(|v| {
                let diff = f64::from(*v) - mean;
                diff * diff
            })
            .sum::<f64>()
            / values.len() as f64;
        Ok((mean, var.sqrt()))
    }

    #[test]
    fn forward_matches_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(8, 12);
        let weight = Tensor::randn(0f32, 0.05, (12, 8), &device)?;
        let bias = Tensor::randn(0f32, 0.02, 12, &device)?;

        for &dtype in &[DType::F32, DType::F16, DType::BF16] {
            let linear = Linear::new(
                config.clone(),
                weight.to_dtype(dtype)?,
                Some(bias.to_dtype(dtype)?),
            )?;
            let input = Tensor::randn(0f32, 1.0, (2, 5, 8), &device)?.to_dtype(dtype)?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = linear.forward(&input, &policy)?;

            assert_eq!(output.dims(), &[2, 5, 12]);
            assert_eq!(output.dtype(), dtype);

            let reference = reference_linear(&input.to_dtype(DType::F32)?, &weight, &bias)?;
            let max = output
                .to_dtype(DType::F32)?
                .sub(&reference)?
                .abs()?
                .max_all()?
                .to_vec0::<f32>()?;
            let tol = match dtype {
                DType::F16 => 1e-2,
                DType::BF16 => 2e-2,
                _ => 1e-4,
            };
            assert!(max <= tol, "max diff {} for {:?}", max, dtype);
        }

        Ok(())
    }

    #[test]
    fn forward_keeps_leading_axes() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(4, 1),
            &LinearInit::TorchDefault,
            &device,
            DType::F32,
        )?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let pooled = Tensor::randn(0f32, 1.0, (3, 4), &device)?;
        assert_eq!(linear.forward(&pooled, &policy)?.dims(), &[3, 1]);
        let single = Tensor::randn(0f32, 1.0, 4, &device)?;
        assert_eq!(linear.forward(&single, &policy)?.dims(), &[1]);
        let wrong = Tensor::randn(0f32, 1.0, (3, 5), &device)?;
        assert!(linear.forward(&wrong, &policy).is_err());
        Ok(())
    }

    #[test]
    fn glorot_normal_stats_are_reasonable() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(128, 64),
            &LinearInit::XavierNormal,
            &device,
            DType::F32,
        )?;
        let (mean, std) = tensor_stats(linear.weight())?;
        let expected = (2.0f64 / (128.0f64 + 64.0f64)).sqrt();
        assert!(mean.abs() < 5e-3);
        assert!((std - expected).abs() < expected * 0.25);
        Ok(())
    }

    #[test]
    fn torch_default_bounds_weight_and_bias() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(64, 32),
            &LinearInit::TorchDefault,
            &device,
            DType::F32,
        )?;
        let bound = 1.0 / 64f32.sqrt();
        let w_max = linear.weight().abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(w_max <= bound);
        let bias = linear.bias().expect("bias");
        let b_max = bias.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(b_max <= bound);
        assert!(b_max > 0.0);
        Ok(())
    }

    #[test]
    fn kaiming_uniform_respects_scale() -> Result<()> {
        let device = Device::Cpu;
        let init = LinearInit::scaled(
            LinearInit::KaimingUniform {
                negative_slope: 0.0,
            },
            0.5,
        );
        let linear = Linear::with_init(LinearConfig::new(256, 256), &init, &device, DType::F32)?;
        let (_, std) = tensor_stats(linear.weight())?;
        let expected = (2.0f64 / 256.0f64).sqrt() * 0.5;
        assert!((std - expected).abs() < expected * 0.25);
        Ok(())
    }

    #[test]
    fn copied_weights_drive_forward_and_parameters() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(3, 2);
        let linear = Linear::with_init(config, &LinearInit::XavierUniform, &device, DType::F32)?;
        linear.copy_weight_from(&Tensor::full(0.5f32, (2, 3), &device)?)?;
        linear.copy_bias_from(&Tensor::new(&[1f32, -1.0], &device)?)?;

        let input = Tensor::ones((1, 3), DType::F32, &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let out = linear.forward(&input, &policy)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(out, vec![2.5, 0.5]);

        assert_eq!(linear.parameters().len(), 2);
        assert!(linear
            .copy_weight_from(&Tensor::zeros((3, 3), DType::F32, &device)?)
            .is_err());
        Ok(())
    }
}
