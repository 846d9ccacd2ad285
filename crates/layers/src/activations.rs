//! Activation catalogue for the classifier heads and co-attention blocks.
//!
//! Activations keep the input layout. Each implementation promotes inputs to
//! the compute dtype requested by [`PrecisionPolicy`] before evaluating the
//! non-linearity, then casts the result back to the storage dtype.
//!
//! [`LearnableSigmoid`] is the one parametric member: `sigmoid(beta * x)` with
//! a trainable scalar `beta`, used as a soft gate over similarity scores.

use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::ops;
use serde::Deserialize;

use crate::{dtypes::PrecisionPolicy, Module};

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    /// Identity function.
    Identity,
    /// Rectified linear unit.
    Relu,
    /// Hyperbolic tangent.
    Tanh,
    /// Logistic sigmoid.
    Sigmoid,
    /// GeLU with the erf formulation.
    Gelu,
}

/// Common interface shared by activation functions.
pub trait Activation: Send + Sync {
    /// Returns the [`ActivationKind`] for introspection when wiring composite blocks.
    fn kind(&self) -> ActivationKind;

    /// Applies the activation to `input` using the precision rules in `policy`.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        if self.kind == ActivationKind::Identity {
            return policy.cast_to_storage(input);
        }
        let compute = policy.cast_for_matmul(input)?;
        let activated = match self.kind {
            ActivationKind::Relu => compute.relu()?,
            ActivationKind::Tanh => compute.tanh()?,
            ActivationKind::Sigmoid => ops::sigmoid(&compute)?,
            ActivationKind::Gelu => compute.gelu_erf()?,
            ActivationKind::Identity => compute,
        };
        policy.cast_to_storage(&activated)
    }
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}

/// Sigmoid with a learnable temperature: `sigmoid(beta * x)`.
#[derive(Debug, Clone)]
pub struct LearnableSigmoid {
    beta: Var,
}

impl LearnableSigmoid {
    /// Creates the gate with `beta` initialised to `init_beta`.
    pub fn new(init_beta: f32, device: &Device) -> Result<Self> {
        Ok(Self {
            beta: Var::from_tensor(&Tensor::new(init_beta, device)?)?,
        })
    }

    /// Current value of `beta`.
    pub fn beta(&self) -> Result<f32> {
        self.beta.as_tensor().to_dtype(DType::F32)?.to_vec0::<f32>()
    }

    /// Applies the gate element-wise.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        let beta = self.beta.as_tensor().to_dtype(compute.dtype())?;
        let scaled = compute.broadcast_mul(&beta)?;
        policy.cast_to_storage(&ops::sigmoid(&scaled)?)
    }
}

impl Module for LearnableSigmoid {
    fn parameters(&self) -> Vec<Var> {
        vec![self.beta.clone()]
    }
}
