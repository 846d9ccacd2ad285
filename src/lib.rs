//! Multimodal fusion building blocks on Candle.
//!
//! Re-exports the member crates and provides backend selection for callers
//! that assemble the blocks into a model.

pub use attention;
pub use fusion;
pub use layers;

pub use attention::{
    AttentionError, CoAttentionConfig, CoAttentionOutput, MultiHeadAttention, ParallelCoAttention,
};
pub use fusion::{FusionConfig, FusionError};
pub use layers::Module;

use anyhow::Result;
use candle_core::Device;

/// Picks the best available backend.
///
/// `CANDLE_FORCE_CPU` short-circuits detection. With the `metal` feature a
/// Metal device is used when it passes a small preflight; otherwise CUDA is
/// tried before falling back to the CPU.
pub fn setup_device() -> Result<Device> {
    if std::env::var("CANDLE_FORCE_CPU").is_ok() {
        log::info!("CANDLE_FORCE_CPU set, using CPU backend");
        return Ok(Device::Cpu);
    }
    #[cfg(feature = "metal")]
    {
        use std::panic::AssertUnwindSafe;

        let metal_device = std::panic::catch_unwind(AssertUnwindSafe(|| Device::new_metal(0)));
        match metal_device {
            Ok(Ok(device)) if metal_preflight(&device).is_ok() => {
                log::info!("metal device selected: {device:?}");
                return Ok(device);
            }
            Ok(Ok(_)) => log::warn!("metal device detected but preflight failed, falling back"),
            _ => log::debug!("metal unavailable, falling back"),
        }
    }

    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            log::info!("cuda device selected: {device:?}");
            Ok(device)
        }
        Ok(_) | Err(_) => {
            log::info!("using CPU backend");
            Ok(Device::Cpu)
        }
    }
}

/// Exercises the ops co-attention relies on: batched matmul, transpose and masking.
#[cfg(feature = "metal")]
fn metal_preflight(device: &Device) -> Result<()> {
    use candle_core::{DType, Tensor};

    let w = Tensor::ones((4, 8), DType::F32, device)?;
    let v = Tensor::randn(0.0f32, 1.0, (2, 8, 5), device)?;
    let projected = w.broadcast_matmul(&v)?;
    let _ = projected.matmul(&v.transpose(1, 2)?.contiguous()?)?;

    let keep = Tensor::ones((2, 4, 5), DType::U8, device)?;
    let _ = keep.where_cond(&projected, &projected.zeros_like()?)?;
    Ok(())
}
