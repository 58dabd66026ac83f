//! Tensor operations.
//!
//! ```text
//! elementwise   apply / apply_binary / scale / add / mul / diag_embed
//! permutedims   axis permutation
//! matmul        2-D and batched products through faer
//! slice         narrow / index_select / concat along one axis
//! reduce        sum over an axis or over trailing axes
//! ```

mod elementwise;
mod matmul;
mod permutedims;
mod reduce;
mod slice;

pub use elementwise::{
    add, add_inplace, apply, apply_binary, apply_inplace, diag_embed, mul, scale, scale_inplace, square,
};
pub use matmul::{batched_matmul, matmul};
pub use permutedims::permutedims;
pub use reduce::{sum_axis, sum_leading, sum_trailing};
pub use slice::{concat, index_select, narrow};
