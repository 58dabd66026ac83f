//! Closed-form diagonals of `J_θᵀ S Sᵀ J_θ`.
//!
//! Given a backpropagated factor `S: [N', V, *out]`, the diagonal of the
//! curvature block of parameter `θ` is `Σ_v (J_θᵀ S[n, v])²`, summed over
//! samples or kept per sample. The routines here compute it without
//! materialising `J_θᵀ S` per direction where the layer structure allows.

pub(crate) mod conv;
pub(crate) mod linear;

use crate::derivatives::Derivatives;
use crate::error::BackpropError;
use crate::module::{Module, ModuleIo};
use crate::operations::{square, sum_axis, sum_leading};
use crate::tensor::DenseTensor;

/// `Σ_v t[n, v, ..]²`, giving `[N', ..]`.
pub(crate) fn sum_squares_over_directions(t: &DenseTensor<f64>) -> Result<DenseTensor<f64>, BackpropError> {
    Ok(sum_axis(&square(t), 1)?)
}

/// Sum out the sample axis when `sum_batch` is set.
pub(crate) fn reduce_batch(t: DenseTensor<f64>, sum_batch: bool) -> Result<DenseTensor<f64>, BackpropError> {
    if sum_batch {
        Ok(sum_leading(&t, 1)?)
    } else {
        Ok(t)
    }
}

/// Diagonal through the generic parameter-Jacobian product, for layers
/// without a closed form.
pub(crate) fn via_param_jacobian(
    derivatives: &dyn Derivatives,
    module: &dyn Module,
    io: &ModuleIo,
    param: &str,
    factor: &DenseTensor<f64>,
    sum_batch: bool,
    subsampling: Option<&[usize]>,
) -> Result<DenseTensor<f64>, BackpropError> {
    let jts = derivatives.param_jac_t_mat_prod(module, io, param, factor, false, subsampling)?;
    reduce_batch(sum_squares_over_directions(&jts)?, sum_batch)
}
