//! Bridge between curvprop tensors and faer's dense kernels.
//!
//! Tensors are handed to faer as row-major matrix views without copying;
//! the batched products in the derivative routines all go through
//! [`crate::operations::matmul`], which builds on these views.

mod faer_interop;

pub use faer_interop::{AsFaerMat, tensor_from_faer_mat};
