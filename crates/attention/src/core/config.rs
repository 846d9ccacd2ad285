//! Configuration options shared by all attention implementations.
//!
//! The [`Config`] struct captures run-time knobs such as dropout and the
//! precision used for scores. Values can come from code, from a serde
//! document, or from the `ATTENTION_DROPOUT` / `ATTENTION_PRECISION`
//! environment variables.

use candle_core::DType;
use layers::dtypes::PrecisionPolicy;
use serde::Deserialize;

use super::AttentionError;

/// How activations are promoted before projections and score matmuls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionMode {
    /// Promote half precision inputs to `f32` for every matmul.
    #[default]
    ForceF32,
    /// Compute in the input dtype; softmax still runs in `f32`.
    Inherit,
}

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Probability for dropout applied to attention weights during training.
    ///
    /// When `None`, dropout is disabled and the computation is deterministic.
    pub dropout_p: Option<f32>,
    /// Precision used for projections and score computation.
    pub precision: PrecisionMode,
}

impl Config {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies `ATTENTION_DROPOUT` and `ATTENTION_PRECISION` when set and parseable.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var("ATTENTION_DROPOUT") {
            match raw.trim().parse::<f32>() {
                Ok(p) => self.dropout_p = Some(p),
                Err(_) => log::warn!("ignoring unparseable ATTENTION_DROPOUT={raw:?}"),
            }
        }
        if let Ok(raw) = std::env::var("ATTENTION_PRECISION") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "f32" | "force_f32" => self.precision = PrecisionMode::ForceF32,
                "inherit" => self.precision = PrecisionMode::Inherit,
                _ => log::warn!("ignoring unknown ATTENTION_PRECISION={raw:?}"),
            }
        }
    }

    /// Checks that the dropout probability is in `[0, 1)`.
    pub fn validate(&self) -> Result<(), AttentionError> {
        match self.dropout_p {
            Some(p) if !(0.0..1.0).contains(&p) => Err(AttentionError::InvalidConfig(format!(
                "dropout probability must be in [0, 1), got {p}"
            ))),
            _ => Ok(()),
        }
    }

    /// Precision policy for activations stored as `dtype`.
    pub fn policy_for(&self, dtype: DType) -> PrecisionPolicy {
        match self.precision {
            PrecisionMode::ForceF32 => PrecisionPolicy::from_parameter_dtype(dtype),
            PrecisionMode::Inherit => PrecisionPolicy::inherit(dtype),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropout_range_is_validated() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        config.dropout_p = Some(1.0);
        assert!(matches!(
            config.validate(),
            Err(AttentionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn precision_mode_selects_policy() {
        let force = Config::default().policy_for(DType::BF16);
        assert_eq!(force.compute(), DType::F32);
        let inherit = Config {
            precision: PrecisionMode::Inherit,
            ..Config::default()
        }
        .policy_for(DType::BF16);
        assert_eq!(inherit.compute(), DType::BF16);
        assert_eq!(inherit.reduction(), DType::F32);
    }
}
