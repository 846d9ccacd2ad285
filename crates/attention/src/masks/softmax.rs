//! Masked softmax over the last axis.

use candle_core::{DType, Error, Result, Shape, Tensor, D};
use candle_nn::ops::softmax;

/// Broadcast a validity mask to `target` as a `u8` keep-mask.
///
/// Accepted mask layouts:
/// * same rank as `target` and broadcast-compatible;
/// * `[batch, k_len]` against a `target` of rank > 2, expanded to
///   `[batch, 1, .., 1, k_len]`;
/// * `[k_len]`, shared across the batch.
pub fn align_validity(valid: &Tensor, target: &Shape) -> Result<Tensor> {
    let target_dims = target.dims();
    let rank = target_dims.len();
    let dims = valid.dims();
    let expanded = match dims.len() {
        r if r == rank => valid.clone(),
        1 if rank > 1 => {
            let mut shape = vec![1usize; rank - 1];
            shape.push(dims[0]);
            valid.reshape(shape)?
        }
        2 if rank > 2 => {
            let mut shape = vec![dims[0]];
            shape.extend(std::iter::repeat(1).take(rank - 2));
            shape.push(dims[1]);
            valid.reshape(shape)?
        }
        _ => {
            return Err(Error::Msg(format!(
                "mask of shape {dims:?} cannot be aligned with scores {target_dims:?}"
            )))
        }
    };
    let keep = expanded.ne(&expanded.zeros_like()?)?;
    keep.broadcast_as(target.clone())
}

/// Replace entries whose mask is zero with `value`.
pub fn masked_fill(scores: &Tensor, valid: &Tensor, value: f32) -> Result<Tensor> {
    let keep = align_validity(valid, scores.shape())?;
    let fill = Tensor::full(value, scores.dims(), scores.device())?.to_dtype(scores.dtype())?;
    keep.where_cond(scores, &fill)
}

/// Softmax over the last axis with padded positions forced to zero probability.
///
/// Scores are promoted to `f32` (or kept in `f64`) before masking so `-inf`
/// and the exponentials cannot overflow in half precision; the probabilities
/// are returned in the dtype of `scores`. The softmax is composed from tracked
/// tensor ops, so gradients flow back into `scores`.
pub fn masked_softmax(scores: &Tensor, valid: Option<&Tensor>) -> Result<Tensor> {
    let dtype = scores.dtype();
    let wide = match dtype {
        DType::F64 => scores.clone(),
        _ => scores.to_dtype(DType::F32)?,
    };
    let filled = match valid {
        Some(valid) => masked_fill(&wide, valid, f32::NEG_INFINITY)?,
        None => wide,
    };
    softmax(&filled, D::Minus1)?.to_dtype(dtype)
}
