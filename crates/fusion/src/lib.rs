//! Gating and aggregation heads for multimodal classifiers.
//!
//! These blocks sit after the per-modality encoders: [`ImageCaptionGate`] and
//! [`ImageCaptionGate2`] score image/caption agreement, and the aggregation
//! modules pool the per-stream vectors into one feature. [`FusionConfig`]
//! gathers the hyper-parameters of these heads together with those of the
//! attention blocks they are usually combined with.

pub mod aggregation;
pub mod config;
mod error;
pub mod gates;

pub use aggregation::{FeatureAggregation, FeatureNoGateAggregation};
pub use config::FusionConfig;
pub use error::FusionError;
pub use gates::{ImageCaptionGate, ImageCaptionGate2};
