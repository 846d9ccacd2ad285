//! Lightweight validation helpers shared across layer and attention code.
//!
//! Every helper takes a short `context` label (for example `"linear.weight"`)
//! that is echoed in the error so failures point at the offending argument.
//! They return `candle_core::Result` so call sites can propagate with `?`.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(context: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

/// Ensures a tensor has exactly `rank` dimensions.
pub fn expect_rank(context: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected rank {rank}, got {:?}",
            tensor.dims()
        )))
    }
}

/// Validates the `(batch, seq, hidden)` convention and returns `(batch, seq)`.
pub fn expect_batch_seq_hidden(
    context: &str,
    tensor: &Tensor,
    hidden: usize,
) -> Result<(usize, usize)> {
    match tensor.dims() {
        [batch, seq, actual] if *actual == hidden => Ok((*batch, *seq)),
        dims => Err(Error::Msg(format!(
            "{context}: expected (batch, seq, {hidden}) layout, got {dims:?}"
        ))),
    }
}

/// Validates the `(batch, hidden)` convention and returns `batch`.
pub fn expect_batch_hidden(context: &str, tensor: &Tensor, hidden: usize) -> Result<usize> {
    match tensor.dims() {
        [batch, actual] if *actual == hidden => Ok(*batch),
        dims => Err(Error::Msg(format!(
            "{context}: expected (batch, {hidden}) layout, got {dims:?}"
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(context: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Floating point dtypes accepted for activations and parameters.
pub const FLOAT_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32, DType::F64];

/// Checks that two tensors share a dtype.
pub fn expect_same_dtype(
    left_context: &str,
    left: &Tensor,
    right_context: &str,
    right: &Tensor,
) -> Result<()> {
    if left.dtype() == right.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{left_context} ({:?}) and {right_context} ({:?}) must share a dtype",
            left.dtype(),
            right.dtype()
        )))
    }
}

/// Checks that two tensors live on the same device.
pub fn expect_same_device(
    left_context: &str,
    left: &Tensor,
    right_context: &str,
    right: &Tensor,
) -> Result<()> {
    if left.device().same_device(right.device()) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{left_context} and {right_context} must reside on the same device"
        )))
    }
}

/// Rejects casts Candle cannot perform on floating point storage.
pub fn ensure_cast_supported(context: &str, from: DType, to: DType) -> Result<()> {
    if FLOAT_DTYPES.contains(&from) && FLOAT_DTYPES.contains(&to) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: unsupported cast {from:?} -> {to:?}"
        )))
    }
}
