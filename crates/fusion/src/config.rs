//! Serde configuration for the fusion heads.
//!
//! Every field has a default so a document only needs to name what it
//! changes. Files ending in `.json` are parsed as JSON, anything else as TOML.

use std::{fs, path::Path};

use attention::{CoAttentionConfig, Config as AttentionConfig, DualCrossConfig};
use layers::{conv::KernelSpec, mlp::MlpConfig};
use serde::Deserialize;

use crate::FusionError;

/// Classifier widths shared by the MLP head and the image classifier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MlpSection {
    pub dims: Vec<usize>,
    pub dropout: f32,
}

impl Default for MlpSection {
    fn default() -> Self {
        Self {
            dims: vec![384],
            dropout: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoAttentionSection {
    pub co_attention_dim: usize,
    pub mask_in: bool,
}

impl Default for CoAttentionSection {
    fn default() -> Self {
        Self {
            co_attention_dim: 128,
            mask_in: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CrossAttentionSection {
    pub num_heads: usize,
    pub dropout: f32,
    pub num_layers: usize,
}

impl Default for CrossAttentionSection {
    fn default() -> Self {
        Self {
            num_heads: 4,
            dropout: 0.0,
            num_layers: 1,
        }
    }
}

/// Aggregate configuration for the blocks of a multimodal classifier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Width of every pooled and sequence feature.
    pub emb_dim: usize,
    pub mlp: MlpSection,
    pub co_attention: CoAttentionSection,
    pub cross_attention: CrossAttentionSection,
    /// Dropout and precision for the multi-head attention kernels.
    pub attention: AttentionConfig,
    /// Convolution branches of the text CNN extractor.
    pub kernels: Vec<KernelSpec>,
    /// Seed for dropout mask streams.
    pub seed: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            emb_dim: 768,
            mlp: MlpSection::default(),
            co_attention: CoAttentionSection::default(),
            cross_attention: CrossAttentionSection::default(),
            attention: AttentionConfig::default(),
            kernels: [1, 2, 3, 5, 10]
                .into_iter()
                .map(|width| KernelSpec { width, channels: 64 })
                .collect(),
            seed: 0,
        }
    }
}

impl FusionConfig {
    /// Loads, applies environment overrides and validates a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FusionError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: FusionConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(FusionError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )))
            }
        };
        config.attention.apply_env_overrides();
        config.validate()?;
        log::info!(
            "fusion config loaded from {} emb_dim={} mlp_dims={:?} co_attention_dim={}",
            path.display(),
            config.emb_dim,
            config.mlp.dims,
            config.co_attention.co_attention_dim
        );
        Ok(config)
    }

    /// Collects every violated constraint into a single error.
    pub fn validate(&self) -> Result<(), FusionError> {
        let mut errors = Vec::new();
        if self.emb_dim == 0 {
            errors.push("emb_dim must be greater than 0".to_string());
        }
        if self.mlp.dims.is_empty() || self.mlp.dims.contains(&0) {
            errors.push("mlp.dims must be non-empty and every width greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.mlp.dropout) {
            errors.push("mlp.dropout must be in [0, 1)".to_string());
        }
        if self.co_attention.co_attention_dim == 0 {
            errors.push("co_attention.co_attention_dim must be greater than 0".to_string());
        }
        let heads = self.cross_attention.num_heads;
        if heads == 0 || self.emb_dim % heads != 0 {
            errors.push(format!(
                "cross_attention.num_heads ({heads}) must divide emb_dim ({})",
                self.emb_dim
            ));
        }
        if !(0.0..1.0).contains(&self.cross_attention.dropout) {
            errors.push("cross_attention.dropout must be in [0, 1)".to_string());
        }
        if self.cross_attention.num_layers == 0 {
            errors.push("cross_attention.num_layers must be greater than 0".to_string());
        }
        if let Err(err) = self.attention.validate() {
            errors.push(err.to_string());
        }
        if self.kernels.iter().any(|k| k.width == 0 || k.channels == 0) {
            errors.push("kernels must have non-zero width and channels".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(FusionError::Validation(errors))
        }
    }

    /// Width of the last MLP hidden layer, used by the image classifier.
    pub fn classifier_width(&self) -> usize {
        self.mlp.dims.last().copied().unwrap_or(self.emb_dim)
    }

    pub fn co_attention_config(&self) -> CoAttentionConfig {
        CoAttentionConfig {
            hidden_dim: self.emb_dim,
            co_attention_dim: self.co_attention.co_attention_dim,
            mask_in: self.co_attention.mask_in,
        }
    }

    pub fn dual_cross_config(&self) -> DualCrossConfig {
        DualCrossConfig::new(
            self.emb_dim,
            self.cross_attention.num_heads,
            self.cross_attention.dropout,
            self.cross_attention.num_layers,
        )
    }

    /// Classifier MLP over `input_dim` features ending in a single logit.
    pub fn mlp_config(&self, input_dim: usize) -> MlpConfig {
        MlpConfig::new(input_dim, self.mlp.dims.clone(), self.mlp.dropout)
    }
}
