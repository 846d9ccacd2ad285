//! Bidirectional cross-attention between two feature streams.
//!
//! Each layer lets stream one attend to stream two and stream two attend to
//! stream one, both from the inputs of the layer. Masks are `(batch, len)`
//! validity masks of the stream being attended to.

use candle_core::{DType, Device, Tensor, Var};
use layers::Module;
use serde::Deserialize;

use crate::core::AttentionError;
use crate::masks::concat_validity;
use crate::multi_head::{MultiHeadAttention, MultiHeadConfig};

/// Hyper-parameters of a [`DualCrossAttentionFusion`] stack.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DualCrossConfig {
    pub embed_dim: usize,
    pub num_heads: usize,
    #[serde(default)]
    pub dropout: f32,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
}

fn default_num_layers() -> usize {
    1
}

impl DualCrossConfig {
    pub fn new(embed_dim: usize, num_heads: usize, dropout: f32, num_layers: usize) -> Self {
        Self {
            embed_dim,
            num_heads,
            dropout,
            num_layers,
        }
    }

    fn attention(&self) -> MultiHeadConfig {
        MultiHeadConfig::new(self.embed_dim, self.num_heads).with_dropout(self.dropout)
    }
}

/// One round of stream-1 → stream-2 and stream-2 → stream-1 attention.
#[derive(Debug, Clone)]
pub struct DualCrossAttentionLayer {
    first_to_second: MultiHeadAttention,
    second_to_first: MultiHeadAttention,
}

impl DualCrossAttentionLayer {
    pub fn new(
        config: &DualCrossConfig,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        Ok(Self {
            first_to_second: MultiHeadAttention::new(config.attention(), seed, device, dtype)?,
            second_to_first: MultiHeadAttention::new(
                config.attention(),
                seed.wrapping_add(1),
                device,
                dtype,
            )?,
        })
    }

    /// Returns the updated `(first, second)` streams with unchanged shapes.
    pub fn forward(
        &self,
        first: &Tensor,
        second: &Tensor,
        first_mask: &Tensor,
        second_mask: &Tensor,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        let updated_first = self
            .first_to_second
            .forward(first, second, second, Some(second_mask))?
            .output;
        let updated_second = self
            .second_to_first
            .forward(second, first, first, Some(first_mask))?
            .output;
        Ok((updated_first, updated_second))
    }
}

impl Module for DualCrossAttentionLayer {
    fn parameters(&self) -> Vec<Var> {
        let mut params = self.first_to_second.parameters();
        params.extend(self.second_to_first.parameters());
        params
    }

    fn set_training(&self, training: bool) {
        self.first_to_second.set_training(training);
        self.second_to_first.set_training(training);
    }
}

/// Stacked [`DualCrossAttentionLayer`]s followed by sequence concatenation.
#[derive(Debug, Clone)]
pub struct DualCrossAttentionFusion {
    config: DualCrossConfig,
    blocks: Vec<DualCrossAttentionLayer>,
}

impl DualCrossAttentionFusion {
    pub fn new(
        config: DualCrossConfig,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        if config.num_layers == 0 {
            return Err(AttentionError::InvalidConfig(
                "dual cross attention needs at least one layer".into(),
            ));
        }
        let blocks = (0..config.num_layers)
            .map(|index| {
                DualCrossAttentionLayer::new(&config, seed.wrapping_add(2 * index as u64), device, dtype)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { config, blocks })
    }

    pub fn config(&self) -> &DualCrossConfig {
        &self.config
    }

    /// Runs every layer and returns the streams and masks concatenated on the sequence axis.
    ///
    /// Output features are `(batch, len1 + len2, embed_dim)` and the mask is
    /// `(batch, len1 + len2)` `u8`.
    pub fn forward(
        &self,
        first: &Tensor,
        second: &Tensor,
        first_mask: &Tensor,
        second_mask: &Tensor,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        let mut first = first.clone();
        let mut second = second.clone();
        for block in &self.blocks {
            (first, second) = block.forward(&first, &second, first_mask, second_mask)?;
        }
        let fused = Tensor::cat(&[&first, &second], 1)?;
        let mask = concat_validity(first_mask, second_mask)?;
        Ok((fused, mask))
    }
}

impl Module for DualCrossAttentionFusion {
    fn parameters(&self) -> Vec<Var> {
        self.blocks.iter().flat_map(Module::parameters).collect()
    }

    fn set_training(&self, training: bool) {
        for block in &self.blocks {
            block.set_training(training);
        }
    }
}
