//! Validity masks and masked softmax shared by every attention block.
//!
//! A validity mask marks real positions with a non-zero value and padding with
//! zero, in any numeric dtype. Masks are usually `[batch, len]` and are
//! aligned to score tensors on the batch (first) and key (last) axes. Masked
//! scores are set to `-inf` before a softmax evaluated in `f32`, so padded
//! positions receive exactly zero probability. A row without any valid
//! position normalises to NaN; callers must keep at least one valid entry.

pub mod padding;
pub mod softmax;

use candle_core::DType;

/// Dtype of additive masks produced by [`additive_from_validity`].
pub const MASK_DTYPE: DType = DType::F32;

pub use padding::{
    additive_from_validity, concat_validity, validity_from_booleans, validity_from_lengths,
};
pub use softmax::{align_validity, masked_fill, masked_softmax};
