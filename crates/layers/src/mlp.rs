//! Feed-forward classifier stack over pooled feature vectors.
//!
//! The MLP consumes `(batch, input_dim)` (or any layout whose last axis is
//! `input_dim`) and applies, for each configured width, `Linear -> ReLU ->
//! Dropout`. With `output_layer` set a final `Linear(.., 1)` produces a single
//! logit per row.

use candle_core::{DType, Device, Result, Tensor, Var};
use serde::Deserialize;

use crate::{
    activations::{builtin, Activation, ActivationKind},
    dropout::Dropout,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    LayerError, Module,
};

/// Configuration for [`Mlp`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MlpConfig {
    /// Width of the incoming features.
    pub input_dim: usize,
    /// Hidden widths, one `Linear -> ReLU -> Dropout` stage each.
    pub embed_dims: Vec<usize>,
    /// Dropout probability applied after every hidden activation.
    #[serde(default)]
    pub dropout: f32,
    /// Append a final projection to a single logit.
    #[serde(default = "default_output_layer")]
    pub output_layer: bool,
}

fn default_output_layer() -> bool {
    true
}

impl MlpConfig {
    /// Creates a configuration that ends in a single-logit output layer.
    pub fn new(input_dim: usize, embed_dims: Vec<usize>, dropout: f32) -> Self {
        Self {
            input_dim,
            embed_dims,
            dropout,
            output_layer: true,
        }
    }

    /// Width of the tensor returned by [`Mlp::forward`].
    pub fn output_dim(&self) -> usize {
        if self.output_layer {
            1
        } else {
            self.embed_dims.last().copied().unwrap_or(self.input_dim)
        }
    }

    /// Checks widths and the dropout range.
    pub fn validate(&self) -> std::result::Result<(), LayerError> {
        if self.input_dim == 0 || self.embed_dims.contains(&0) {
            return Err(LayerError::InvalidConfig(
                "mlp widths must be greater than zero".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(LayerError::InvalidConfig(format!(
                "mlp dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// Shared interface for feed-forward stacks.
pub trait FeedForwardLayer: Send + Sync {
    /// Configuration metadata used during block assembly.
    fn config(&self) -> &MlpConfig;

    /// Performs the forward pass through the MLP.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

struct Stage {
    linear: Linear,
    dropout: Dropout,
}

/// `Linear -> ReLU -> Dropout` stack with an optional scalar head.
pub struct Mlp {
    config: MlpConfig,
    stages: Vec<Stage>,
    activation: std::sync::Arc<dyn Activation>,
    output: Option<Linear>,
}

impl std::fmt::Debug for Mlp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mlp").field("config", &self.config).finish()
    }
}

impl Mlp {
    /// Builds the stack with PyTorch-style default initialisation.
    pub fn new(config: MlpConfig, seed: u64, device: &Device, dtype: DType) -> Result<Self> {
        config.validate()?;
        let init = LinearInit::TorchDefault;
        let mut stages = Vec::with_capacity(config.embed_dims.len());
        let mut input_dim = config.input_dim;
        for (index, &width) in config.embed_dims.iter().enumerate() {
            let linear = Linear::with_init(LinearConfig::new(input_dim, width), &init, device, dtype)?;
            let dropout = Dropout::new(Some(config.dropout), seed.wrapping_add(index as u64));
            stages.push(Stage { linear, dropout });
            input_dim = width;
        }
        let output = if config.output_layer {
            Some(Linear::with_init(
                LinearConfig::new(input_dim, 1),
                &init,
                device,
                dtype,
            )?)
        } else {
            None
        };
        log::debug!(
            "mlp built input_dim={} embed_dims={:?} dropout={} output_layer={}",
            config.input_dim,
            config.embed_dims,
            config.dropout,
            config.output_layer
        );
        Ok(Self {
            config,
            stages,
            activation: builtin(ActivationKind::Relu),
            output,
        })
    }
}

impl FeedForwardLayer for Mlp {
    fn config(&self) -> &MlpConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let mut x = hidden.clone();
        for stage in &self.stages {
            x = stage.linear.forward(&x, policy)?;
            x = self.activation.forward(&x, policy)?;
            x = stage.dropout.forward(&x, policy)?;
        }
        match &self.output {
            Some(output) => output.forward(&x, policy),
            None => Ok(x),
        }
    }
}

impl Module for Mlp {
    fn parameters(&self) -> Vec<Var> {
        self.stages
            .iter()
            .flat_map(|stage| stage.linear.parameters())
            .chain(self.output.iter().flat_map(Module::parameters))
            .collect()
    }

    fn set_training(&self, training: bool) {
        for stage in &self.stages {
            stage.dropout.set_training(training);
        }
    }
}
