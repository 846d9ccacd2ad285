//! Builders for validity masks over padded sequences.

use candle_core::{DType, Device, Error, Result, Tensor};

use super::MASK_DTYPE;

/// Construct a `[batch, max_len]` `u8` mask from per-batch valid lengths.
///
/// Lengths larger than `max_len` are clamped.
pub fn validity_from_lengths(device: &Device, lengths: &[usize], max_len: usize) -> Result<Tensor> {
    let mut data = vec![0u8; lengths.len() * max_len];
    for (b, &valid) in lengths.iter().enumerate() {
        let row = b * max_len;
        data[row..row + valid.min(max_len)].fill(1);
    }
    Tensor::from_vec(data, (lengths.len(), max_len), device)
}

/// Construct a `[batch, len]` `u8` mask from boolean indicators.
///
/// `true` marks a valid (kept) position. Every row must share the same length.
pub fn validity_from_booleans(device: &Device, valid: &[Vec<bool>]) -> Result<Tensor> {
    let len = valid.first().map(Vec::len).unwrap_or(0);
    if let Some(row) = valid.iter().position(|row| row.len() != len) {
        return Err(Error::Msg(format!(
            "validity row {row} has length {}, expected {len}",
            valid[row].len()
        )));
    }
    let data: Vec<u8> = valid.iter().flatten().map(|&keep| u8::from(keep)).collect();
    Tensor::from_vec(data, (valid.len(), len), device)
}

/// Convert a validity mask into an additive mask (`0.0` keep, `-inf` drop).
pub fn additive_from_validity(valid: &Tensor) -> Result<Tensor> {
    let keep = valid.ne(&valid.zeros_like()?)?;
    let zeros = Tensor::zeros(valid.dims(), MASK_DTYPE, valid.device())?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, valid.dims(), valid.device())?;
    keep.where_cond(&zeros, &neg_inf)
}

/// Concatenate two `[batch, len]` validity masks along the sequence axis.
///
/// Inputs may differ in dtype; the result is `u8`.
pub fn concat_validity(first: &Tensor, second: &Tensor) -> Result<Tensor> {
    let first = first.ne(&first.zeros_like()?)?;
    let second = second.ne(&second.zeros_like()?)?;
    Tensor::cat(&[&first, &second], 1)?.to_dtype(DType::U8)
}
