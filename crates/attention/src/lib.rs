//! Attention primitives for multimodal feature fusion.
//!
//! The crate is centred on [`ParallelCoAttention`], which lets a region
//! stream `(batch, hidden_dim, region_count)` and a sequence stream
//! `(batch, sequence_length, hidden_dim)` attend over their own positions
//! guided by a learned bilinear affinity with each other. Around it sit the
//! supporting pieces used by the fusion heads: validity masks and masked
//! softmax, scaled dot-product and multi-head attention, attention and
//! average pooling, and bidirectional cross-attention.
//!
//! Masks are validity masks: non-zero marks a real position, zero marks
//! padding. Softmax normalisation always runs in at least `f32` and results
//! are cast back to the input dtype. A row whose positions are all masked
//! produces NaN weights; guaranteeing at least one valid position is the
//! caller's responsibility.
//!
//! Dropout is a train-only concern controlled via [`Config`]; modules start in
//! training mode and are switched with [`layers::Module::set_training`].

pub mod co_attention;
pub mod core;
pub mod cross;
pub mod masks;
pub mod multi_head;
pub mod pooling;
pub mod reference;

pub use co_attention::{CoAttentionConfig, CoAttentionOutput, CoAttentionWeights, ParallelCoAttention};
pub use core::{Attention, AttentionError, AttentionOutput, Config, PrecisionMode};
pub use cross::{DualCrossAttentionFusion, DualCrossAttentionLayer, DualCrossConfig};
pub use multi_head::{MultiHeadAttention, MultiHeadConfig, SelfAttentionFeatureExtract};
pub use pooling::{AttentionPooling, AvgPooling, MaskAttention};
pub use reference::ScaledDotProductAttention;
