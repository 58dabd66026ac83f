//! Scalar trait for tensor element types.

use faer_traits::ComplexField;
use std::fmt::Debug;

/// Trait for scalar types supported by curvprop tensors.
///
/// Wraps faer's `ComplexField` so dense tensors can be handed to faer's
/// matrix kernels without conversion.
pub trait Scalar: ComplexField + Copy + Debug + Default + PartialOrd + 'static {
    /// Returns the additive identity (zero).
    fn zero() -> Self {
        Self::default()
    }

    /// Returns the multiplicative identity (one).
    fn one() -> Self;

    /// Lossless widening to `f64`.
    fn to_f64(self) -> f64;
}

impl Scalar for f64 {
    fn one() -> Self {
        1.0
    }

    fn to_f64(self) -> f64 {
        self
    }
}

impl Scalar for f32 {
    fn one() -> Self {
        1.0
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}
