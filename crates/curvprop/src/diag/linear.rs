//! Fully connected layers.
//!
//! With `x: [N', in]` and `S: [N', V, out]`,
//! `diag_W[n, o, i] = (Σ_v S[n, v, o]²) · x[n, i]²` and
//! `diag_b[n, o] = Σ_v S[n, v, o]²`.

use super::{reduce_batch, sum_squares_over_directions};
use crate::error::BackpropError;
use crate::operations::{batched_matmul, matmul, square};
use crate::tensor::DenseTensor;

fn check(input: &DenseTensor<f64>, factor: &DenseTensor<f64>) -> Result<(), BackpropError> {
    if input.ndim() != 2 || factor.ndim() != 3 || factor.dim(0) != input.dim(0) {
        return Err(BackpropError::ShapeMismatch {
            context: "Linear diagonal factor",
            expected: vec![input.shape().first().copied().unwrap_or(0), 0, 0],
            actual: factor.shape().to_vec(),
        });
    }
    Ok(())
}

/// `[out, in]` if `sum_batch`, else `[N', out, in]`.
pub(crate) fn weight_diagonal(
    input: &DenseTensor<f64>,
    factor: &DenseTensor<f64>,
    sum_batch: bool,
) -> Result<DenseTensor<f64>, BackpropError> {
    check(input, factor)?;
    let (n, out, inp) = (input.dim(0), factor.dim(2), input.dim(1));
    let sq_factor = sum_squares_over_directions(factor)?;
    let sq_input = square(input);
    if sum_batch {
        Ok(matmul(&sq_factor, &sq_input, true, false)?)
    } else {
        let lhs = sq_factor.reshape(&[n, out, 1])?;
        let rhs = sq_input.reshape(&[n, 1, inp])?;
        Ok(batched_matmul(&lhs, &rhs, false, false)?)
    }
}

/// `[out]` if `sum_batch`, else `[N', out]`.
pub(crate) fn bias_diagonal(factor: &DenseTensor<f64>, sum_batch: bool) -> Result<DenseTensor<f64>, BackpropError> {
    reduce_batch(sum_squares_over_directions(factor)?, sum_batch)
}
