//! Reference query/key/value attention kernels.

pub mod scaled_dot;

pub use scaled_dot::ScaledDotProductAttention;
