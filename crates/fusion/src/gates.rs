//! Gates scoring how well an image agrees with its caption.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor, Var, D};
use layers::{
    activations::{builtin, Activation, ActivationKind},
    checks,
    dropout::Dropout,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    norm::{BatchNorm1d, BatchNormConfig},
    Module,
};

use attention::{AttentionPooling, MultiHeadAttention, MultiHeadConfig};

use crate::{FusionConfig, FusionError};

const NORM_EPS: f64 = 1e-8;
const CLASSIFIER_DROPOUT: f32 = 0.2;
const CLASSIFIER_HIDDEN: usize = 64;

/// Cosine similarity between pooled content and caption features.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCaptionGate;

impl ImageCaptionGate {
    /// Returns the `(batch,)` cosine similarity of two `(batch, emb_dim)` tensors.
    ///
    /// Each norm is clamped to `1e-8` so zero vectors give a similarity of 0.
    pub fn forward(&self, content: &Tensor, caption: &Tensor) -> Result<Tensor, FusionError> {
        if content.rank() != 2 || content.dims() != caption.dims() {
            return Err(FusionError::InvalidShape(format!(
                "image gate expects matching (batch, emb_dim) inputs, got {:?} and {:?}",
                content.dims(),
                caption.dims()
            )));
        }
        let policy = PrecisionPolicy::for_tensor(content);
        let a = policy.cast_for_reduction(content)?;
        let b = policy.cast_for_reduction(caption)?;
        let eps = Tensor::full(NORM_EPS, (), a.device())?.to_dtype(a.dtype())?;
        let dot = (&a * &b)?.sum(D::Minus1)?;
        let norm_a = a.sqr()?.sum(D::Minus1)?.sqrt()?.broadcast_maximum(&eps)?;
        let norm_b = b.sqr()?.sum(D::Minus1)?.sqrt()?.broadcast_maximum(&eps)?;
        let similarity = dot.div(&(norm_a * norm_b)?)?;
        Ok(policy.cast_to_storage(&similarity)?)
    }
}

struct ClassifierStage {
    linear: Linear,
    norm: BatchNorm1d,
    dropout: Dropout,
}

/// `Linear -> BatchNorm -> ReLU -> Dropout` twice, then `Linear(64, 1) -> Sigmoid`.
struct ImageClassifier {
    stages: Vec<ClassifierStage>,
    head: Linear,
    relu: Arc<dyn Activation>,
    sigmoid: Arc<dyn Activation>,
}

impl ImageClassifier {
    fn new(emb_dim: usize, width: usize, seed: u64, device: &Device, dtype: DType) -> Result<Self, FusionError> {
        let init = LinearInit::TorchDefault;
        let mut stages = Vec::with_capacity(2);
        for (index, (input, output)) in [(emb_dim, width), (width, CLASSIFIER_HIDDEN)].into_iter().enumerate() {
            stages.push(ClassifierStage {
                linear: Linear::with_init(LinearConfig::new(input, output), &init, device, dtype)?,
                norm: BatchNorm1d::new(BatchNormConfig::new(output), device, dtype)?,
                dropout: Dropout::new(Some(CLASSIFIER_DROPOUT), seed.wrapping_add(index as u64)),
            });
        }
        let head = Linear::with_init(LinearConfig::new(CLASSIFIER_HIDDEN, 1), &init, device, dtype)?;
        Ok(Self {
            stages,
            head,
            relu: builtin(ActivationKind::Relu),
            sigmoid: builtin(ActivationKind::Sigmoid),
        })
    }

    fn forward(&self, pooled: &Tensor) -> Result<Tensor, FusionError> {
        let policy = PrecisionPolicy::for_tensor(pooled);
        let mut x = pooled.clone();
        for stage in &self.stages {
            x = stage.linear.forward(&x, &policy)?;
            x = stage.norm.forward(&x, &policy)?;
            x = self.relu.forward(&x, &policy)?;
            x = stage.dropout.forward(&x, &policy)?;
        }
        let logits = self.head.forward(&x, &policy)?;
        Ok(self.sigmoid.forward(&logits, &policy)?)
    }
}

impl Module for ImageClassifier {
    fn parameters(&self) -> Vec<Var> {
        self.stages
            .iter()
            .flat_map(|stage| {
                let mut params = stage.linear.parameters();
                params.extend(stage.norm.parameters());
                params
            })
            .chain(self.head.parameters())
            .collect()
    }

    fn set_training(&self, training: bool) {
        for stage in &self.stages {
            stage.norm.set_training(training);
            stage.dropout.set_training(training);
        }
    }
}

/// Learned image/caption consistency score.
///
/// Content tokens attend to the caption with a single head, the attended
/// sequence is pooled over valid content positions, and a batch-normalised
/// classifier maps the pooled vector to a probability.
pub struct ImageCaptionGate2 {
    emb_dim: usize,
    attention: MultiHeadAttention,
    pooling: AttentionPooling,
    classifier: ImageClassifier,
}

impl std::fmt::Debug for ImageCaptionGate2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCaptionGate2")
            .field("emb_dim", &self.emb_dim)
            .field("attention", self.attention.config())
            .finish()
    }
}

impl ImageCaptionGate2 {
    pub fn new(config: &FusionConfig, device: &Device, dtype: DType) -> Result<Self, FusionError> {
        config.validate()?;
        let mut attention_config = MultiHeadConfig::new(config.emb_dim, 1);
        attention_config.attention = config.attention.clone();
        Ok(Self {
            emb_dim: config.emb_dim,
            attention: MultiHeadAttention::new(attention_config, config.seed, device, dtype)?,
            pooling: AttentionPooling::new(config.emb_dim, device, dtype)?,
            classifier: ImageClassifier::new(
                config.emb_dim,
                config.classifier_width(),
                config.seed.wrapping_add(1),
                device,
                dtype,
            )?,
        })
    }

    /// Scores `(batch, 1)` consistency in `(0, 1)`.
    ///
    /// `caption` is `(batch, caption_len, emb_dim)` and `content` is
    /// `(batch, content_len, emb_dim)`; masks are the matching validity masks.
    pub fn forward(
        &self,
        caption: &Tensor,
        content: &Tensor,
        caption_mask: &Tensor,
        content_mask: &Tensor,
    ) -> Result<Tensor, FusionError> {
        checks::expect_rank("image_gate2.content_mask", content_mask, 2)?;
        let attended = self
            .attention
            .forward(content, caption, caption, Some(caption_mask))?
            .output;
        let pooled = self.pooling.forward(&attended, Some(content_mask))?;
        self.classifier.forward(&pooled)
    }
}

impl Module for ImageCaptionGate2 {
    fn parameters(&self) -> Vec<Var> {
        let mut params = self.attention.parameters();
        params.extend(self.pooling.parameters());
        params.extend(self.classifier.parameters());
        params
    }

    fn set_training(&self, training: bool) {
        self.attention.set_training(training);
        self.classifier.set_training(training);
    }
}
