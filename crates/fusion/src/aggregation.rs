//! Final pooling over the per-modality feature vectors.
//!
//! Content, image and the two auxiliary streams each arrive as a pooled
//! `(batch, emb_dim)` vector. They are stacked into a four-token sequence in
//! that order and pooled with [`MaskAttention`].

use candle_core::{DType, Device, Tensor, Var};
use layers::{checks, Module};

use attention::MaskAttention;

use crate::{gates::ImageCaptionGate, FusionError};

fn stack_streams(emb_dim: usize, streams: [(&str, &Tensor); 4]) -> Result<Tensor, FusionError> {
    let mut batch = None;
    let mut tokens = Vec::with_capacity(streams.len());
    for (context, stream) in streams {
        let rows = checks::expect_batch_hidden(context, stream, emb_dim)
            .map_err(|err| FusionError::InvalidShape(err.to_string()))?;
        if *batch.get_or_insert(rows) != rows {
            return Err(FusionError::InvalidShape(format!(
                "{context}: batch {rows} differs from the other streams"
            )));
        }
        tokens.push(stream.unsqueeze(1)?);
    }
    Ok(Tensor::cat(&tokens, 1)?)
}

/// Gated aggregation: the image vector is scaled by its cosine agreement
/// with the caption before pooling.
#[derive(Debug, Clone)]
pub struct FeatureAggregation {
    emb_dim: usize,
    gate: ImageCaptionGate,
    pooling: MaskAttention,
}

impl FeatureAggregation {
    pub fn new(emb_dim: usize, device: &Device, dtype: DType) -> Result<Self, FusionError> {
        Ok(Self {
            emb_dim,
            gate: ImageCaptionGate,
            pooling: MaskAttention::new(emb_dim, device, dtype)?,
        })
    }

    pub fn pooling(&self) -> &MaskAttention {
        &self.pooling
    }

    /// Returns the aggregated `(batch, emb_dim)` feature.
    pub fn forward(
        &self,
        content: &Tensor,
        caption: &Tensor,
        image: &Tensor,
        ftr2: &Tensor,
        ftr3: &Tensor,
    ) -> Result<Tensor, FusionError> {
        let gate = self.gate.forward(content, caption)?.unsqueeze(1)?;
        let gated_image = image.broadcast_mul(&gate.to_dtype(image.dtype())?)?;
        let sequence = stack_streams(
            self.emb_dim,
            [
                ("aggregation.content", content),
                ("aggregation.image", &gated_image),
                ("aggregation.ftr2", ftr2),
                ("aggregation.ftr3", ftr3),
            ],
        )?;
        Ok(self.pooling.forward(&sequence, None)?.0)
    }
}

impl Module for FeatureAggregation {
    fn parameters(&self) -> Vec<Var> {
        self.pooling.parameters()
    }
}

/// Aggregation without the image/caption gate.
#[derive(Debug, Clone)]
pub struct FeatureNoGateAggregation {
    emb_dim: usize,
    pooling: MaskAttention,
}

impl FeatureNoGateAggregation {
    pub fn new(emb_dim: usize, device: &Device, dtype: DType) -> Result<Self, FusionError> {
        Ok(Self {
            emb_dim,
            pooling: MaskAttention::new(emb_dim, device, dtype)?,
        })
    }

    pub fn pooling(&self) -> &MaskAttention {
        &self.pooling
    }

    pub fn forward(
        &self,
        content: &Tensor,
        image: &Tensor,
        ftr2: &Tensor,
        ftr3: &Tensor,
    ) -> Result<Tensor, FusionError> {
        let sequence = stack_streams(
            self.emb_dim,
            [
                ("aggregation.content", content),
                ("aggregation.image", image),
                ("aggregation.ftr2", ftr2),
                ("aggregation.ftr3", ftr3),
            ],
        )?;
        Ok(self.pooling.forward(&sequence, None)?.0)
    }
}

impl Module for FeatureNoGateAggregation {
    fn parameters(&self) -> Vec<Var> {
        self.pooling.parameters()
    }
}
