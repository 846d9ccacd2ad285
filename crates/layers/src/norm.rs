//! Batch normalisation over pooled feature vectors.
//!
//! Inputs follow the `(batch, features)` convention used by classifier heads.
//! In training mode the layer normalises with the batch statistics and folds
//! them into exponential running averages; in evaluation mode it uses the
//! running averages only. Statistics are computed in
//! [`PrecisionPolicy::reduction`] and the output is cast back to storage.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use candle_core::{DType, Device, Error, Result, Tensor, Var};

use crate::{checks, dtypes::PrecisionPolicy, Module};

/// Configuration for [`BatchNorm1d`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormConfig {
    /// Number of features (channels) being normalised.
    pub num_features: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
    /// Weight given to the current batch when updating running statistics.
    pub momentum: f64,
}

impl BatchNormConfig {
    /// Creates a configuration with the usual `eps = 1e-5`, `momentum = 0.1`.
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            epsilon: 1e-5,
            momentum: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
struct RunningStats {
    mean: Tensor,
    var: Tensor,
}

/// Batch normalisation with learnable affine parameters.
#[derive(Debug)]
pub struct BatchNorm1d {
    config: BatchNormConfig,
    weight: Var,
    bias: Var,
    running: Mutex<RunningStats>,
    training: AtomicBool,
}

impl BatchNorm1d {
    /// Builds the layer with unit scale, zero shift and neutral running statistics.
    pub fn new(config: BatchNormConfig, device: &Device, dtype: DType) -> Result<Self> {
        if config.num_features == 0 {
            return Err(Error::Msg("batch norm requires at least one feature".into()));
        }
        let features = config.num_features;
        Ok(Self {
            weight: Var::ones(features, dtype, device)?,
            bias: Var::zeros(features, dtype, device)?,
            running: Mutex::new(RunningStats {
                mean: Tensor::zeros(features, DType::F32, device)?,
                var: Tensor::ones(features, DType::F32, device)?,
            }),
            training: AtomicBool::new(true),
            config,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &BatchNormConfig {
        &self.config
    }

    /// Snapshot of `(running_mean, running_var)`.
    pub fn running_stats(&self) -> Result<(Tensor, Tensor)> {
        let guard = self
            .running
            .lock()
            .map_err(|_| Error::Msg("batch norm statistics mutex poisoned".into()))?;
        Ok((guard.mean.clone(), guard.var.clone()))
    }

    /// Normalises `(batch, features)` input.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let batch = checks::expect_batch_hidden("batch_norm.input", input, self.config.num_features)?;
        let compute = policy.cast_for_reduction(input)?;
        let dtype = compute.dtype();

        let (mean, var) = if self.training.load(Ordering::Relaxed) {
            if batch < 2 {
                return Err(Error::Msg(
                    "batch norm needs more than one sample per feature in training mode".into(),
                ));
            }
            let mean = compute.mean_keepdim(0)?;
            let centered = compute.broadcast_sub(&mean)?;
            let var = centered.sqr()?.mean_keepdim(0)?;
            self.update_running(&mean, &var, batch)?;
            (mean, var)
        } else {
            let guard = self
                .running
                .lock()
                .map_err(|_| Error::Msg("batch norm statistics mutex poisoned".into()))?;
            (
                guard.mean.to_dtype(dtype)?.unsqueeze(0)?,
                guard.var.to_dtype(dtype)?.unsqueeze(0)?,
            )
        };

        let denom = (var + self.config.epsilon)?.sqrt()?;
        let normalized = compute.broadcast_sub(&mean)?.broadcast_div(&denom)?;
        let weight = self.weight.as_tensor().to_dtype(dtype)?;
        let bias = self.bias.as_tensor().to_dtype(dtype)?;
        let out = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;
        policy.cast_to_storage(&out)
    }

    fn update_running(&self, mean: &Tensor, var: &Tensor, batch: usize) -> Result<()> {
        let momentum = self.config.momentum;
        let unbiased = (var.to_dtype(DType::F32)?.squeeze(0)? * (batch as f64 / (batch - 1) as f64))?;
        let mean = mean.to_dtype(DType::F32)?.squeeze(0)?.detach();
        let mut guard = self
            .running
            .lock()
            .map_err(|_| Error::Msg("batch norm statistics mutex poisoned".into()))?;
        guard.mean = ((&guard.mean * (1.0 - momentum))? + (mean * momentum)?)?;
        guard.var = ((&guard.var * (1.0 - momentum))? + (unbiased.detach() * momentum)?)?;
        Ok(())
    }
}

impl Module for BatchNorm1d {
    fn parameters(&self) -> Vec<Var> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }
}
