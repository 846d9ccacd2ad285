//! Inverted dropout with a seeded, reproducible mask stream.
//!
//! Dropout is only active while the owning module is in training mode. Kept
//! activations are scaled by `1 / (1 - p)` so evaluation needs no rescaling.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use candle_core::{Error, Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Dropout policy resolved from an optional probability.
#[derive(Debug)]
pub enum DropoutMode {
    /// Dropout is disabled (probability is zero or absent).
    Disabled,
    /// Dropout is active and uses the supplied probability and RNG state.
    Enabled { probability: f32, rng: Mutex<Lcg64> },
}

impl Clone for DropoutMode {
    fn clone(&self) -> Self {
        match self {
            DropoutMode::Disabled => DropoutMode::Disabled,
            DropoutMode::Enabled { probability, rng } => {
                // A poisoned lock only loses the stream position.
                let state = rng.lock().map(|guard| guard.clone()).unwrap_or_else(|_| Lcg64::new(0));
                DropoutMode::Enabled {
                    probability: *probability,
                    rng: Mutex::new(state),
                }
            }
        }
    }
}

impl DropoutMode {
    /// Builds a mode from an optional probability; `None`, `<= 0` or `>= 1` disables dropout.
    pub fn from_probability(probability: Option<f32>, seed: u64) -> Self {
        match probability.unwrap_or(0.0) {
            p if p <= 0.0 || p >= 1.0 => DropoutMode::Disabled,
            p => DropoutMode::Enabled {
                probability: p,
                rng: Mutex::new(Lcg64::new(seed)),
            },
        }
    }

    /// Probability of zeroing an element, `0.0` when disabled.
    pub fn probability(&self) -> f32 {
        match self {
            DropoutMode::Disabled => 0.0,
            DropoutMode::Enabled { probability, .. } => *probability,
        }
    }
}

/// Dropout layer with its own training flag.
pub struct Dropout {
    mode: DropoutMode,
    training: AtomicBool,
}

impl Clone for Dropout {
    fn clone(&self) -> Self {
        Self {
            mode: self.mode.clone(),
            training: AtomicBool::new(self.is_training()),
        }
    }
}

impl fmt::Debug for Dropout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dropout")
            .field("probability", &self.mode.probability())
            .field("training", &self.is_training())
            .finish()
    }
}

impl Dropout {
    /// Creates a dropout layer; layers start in training mode.
    pub fn new(probability: Option<f32>, seed: u64) -> Self {
        Self {
            mode: DropoutMode::from_probability(probability, seed),
            training: AtomicBool::new(true),
        }
    }

    /// Enables or disables dropout.
    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    /// Whether dropout is currently applied.
    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Applies dropout to a tensor of any shape.
    pub fn forward(&self, tensor: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        if !self.is_training() {
            return Ok(tensor.clone());
        }
        match &self.mode {
            DropoutMode::Disabled => Ok(tensor.clone()),
            DropoutMode::Enabled { probability, rng } => {
                let keep_prob = 1.0 - probability;
                let total = tensor.elem_count();
                let mask_data = {
                    let mut rng = rng
                        .lock()
                        .map_err(|_| Error::Msg("dropout RNG mutex poisoned".into()))?;
                    (0..total)
                        .map(|_| {
                            if rng.next_f32() < keep_prob {
                                1.0 / keep_prob
                            } else {
                                0.0
                            }
                        })
                        .collect::<Vec<f32>>()
                };
                let compute = policy.cast_for_matmul(tensor)?;
                let mask = Tensor::from_vec(mask_data, tensor.dims(), tensor.device())?
                    .to_dtype(compute.dtype())?;
                policy.cast_to_storage(&compute.mul(&mask)?)
            }
        }
    }
}

/// Simple 64-bit linear congruential generator for deterministic dropout masks.
#[derive(Debug, Clone)]
pub struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn next_f32(&mut self) -> f32 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        let bits = self.next_u64() >> 11;
        (bits as f64 * SCALE) as f32
    }
}
