//! Contracts for `Linear` and `ParallelLinear`.

use super::{Derivatives, check_mat, sub_input, with_lead};
use crate::error::BackpropError;
use crate::module::{Linear, Module, ModuleIo, ParallelLinear, downcast};
use crate::operations::{batched_matmul, concat, matmul, narrow, permutedims, sum_leading};
use crate::subsampling::subsampled_len;
use crate::tensor::DenseTensor;

/// Contract of [`Linear`]: `J = W`, `J_W = x ⊗ ·`, `J_b = I`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearDerivatives;

fn rows(io: &ModuleIo, subsampling: Option<&[usize]>) -> usize {
    subsampled_len(subsampling, io.input.shape().first().copied().unwrap_or(0))
}

fn jac_t(linear: &Linear, mat: &DenseTensor<f64>, n: usize) -> Result<DenseTensor<f64>, BackpropError> {
    let (n, v) = check_mat("Linear jac_t_mat_prod", mat, &[n, linear.out_features()])?;
    let flat = mat.reshape(&[n * v, linear.out_features()])?;
    Ok(matmul(&flat, linear.weight().value(), false, false)?.reshape(&[n, v, linear.in_features()])?)
}

fn jac(linear: &Linear, mat: &DenseTensor<f64>, n: usize) -> Result<DenseTensor<f64>, BackpropError> {
    let (n, v) = check_mat("Linear jac_mat_prod", mat, &[n, linear.in_features()])?;
    let flat = mat.reshape(&[n * v, linear.in_features()])?;
    Ok(matmul(&flat, linear.weight().value(), false, true)?.reshape(&[n, v, linear.out_features()])?)
}

/// `Σ_n mat[n, v, o] x[n, i]` (or per sample) for inputs `x: [N', in]`.
fn weight_jac_t(
    linear: &Linear,
    x: &DenseTensor<f64>,
    mat: &DenseTensor<f64>,
    sum_batch: bool,
) -> Result<DenseTensor<f64>, BackpropError> {
    let (out, inp) = (linear.out_features(), linear.in_features());
    let (n, v) = check_mat("Linear weight jac_t_mat_prod", mat, &[x.dim(0), out])?;
    if sum_batch {
        let t = permutedims(mat, &[1, 2, 0])?.reshape(&[v * out, n])?;
        Ok(matmul(&t, x, false, false)?.reshape(&[v, out, inp])?)
    } else {
        let lhs = mat.reshape(&[n, v * out, 1])?;
        let rhs = x.reshape(&[n, 1, inp])?;
        Ok(batched_matmul(&lhs, &rhs, false, false)?.reshape(&[n, v, out, inp])?)
    }
}

fn bias_jac_t(
    linear: &Linear,
    mat: &DenseTensor<f64>,
    n: usize,
    sum_batch: bool,
) -> Result<DenseTensor<f64>, BackpropError> {
    check_mat("Linear bias jac_t_mat_prod", mat, &[n, linear.out_features()])?;
    if sum_batch {
        Ok(sum_leading(mat, 1)?)
    } else {
        Ok(mat.clone())
    }
}

fn check_param_mat(
    context: &'static str,
    mat: &DenseTensor<f64>,
    param: &[usize],
) -> Result<usize, BackpropError> {
    if mat.ndim() != param.len() + 1 || mat.shape()[1..] != *param {
        return Err(BackpropError::ShapeMismatch {
            context,
            expected: with_lead(&[0], param),
            actual: mat.shape().to_vec(),
        });
    }
    Ok(mat.dim(0))
}

fn param_jac(
    linear: &Linear,
    x: &DenseTensor<f64>,
    param: &str,
    mat: &DenseTensor<f64>,
) -> Result<DenseTensor<f64>, BackpropError> {
    let n = x.dim(0);
    let out = linear.out_features();
    match (param, linear.bias()) {
        ("weight", _) => {
            let v = check_param_mat("Linear weight jac_mat_prod", mat, linear.weight().shape())?;
            let w = mat.reshape(&[v * out, linear.in_features()])?;
            Ok(matmul(x, &w, false, true)?.reshape(&[n, v, out])?)
        }
        ("bias", Some(b)) => {
            let v = check_param_mat("Linear bias jac_mat_prod", mat, b.shape())?;
            Ok(DenseTensor::from_parts(mat.data().repeat(n), &[n, v, out]))
        }
        _ => Err(unknown(linear, param)),
    }
}

fn param_jac_t(
    linear: &Linear,
    x: &DenseTensor<f64>,
    param: &str,
    mat: &DenseTensor<f64>,
    sum_batch: bool,
) -> Result<DenseTensor<f64>, BackpropError> {
    match (param, linear.has_bias()) {
        ("weight", _) => weight_jac_t(linear, x, mat, sum_batch),
        ("bias", true) => bias_jac_t(linear, mat, x.dim(0), sum_batch),
        _ => Err(unknown(linear, param)),
    }
}

fn unknown(module: &dyn Module, param: &str) -> BackpropError {
    BackpropError::UnknownParameter {
        module: module.name(),
        param: param.to_string(),
    }
}

impl Derivatives for LinearDerivatives {
    fn hessian_is_zero(&self, _module: &dyn Module) -> bool {
        true
    }

    fn jac_t_mat_prod(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        mat: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        jac_t(downcast::<Linear>(module)?, mat, rows(io, subsampling))
    }

    fn jac_mat_prod(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        mat: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        jac(downcast::<Linear>(module)?, mat, rows(io, subsampling))
    }

    fn param_jac_t_mat_prod(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        param: &str,
        mat: &DenseTensor<f64>,
        sum_batch: bool,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let linear = downcast::<Linear>(module)?;
        param_jac_t(linear, &sub_input(io, subsampling)?, param, mat, sum_batch)
    }

    fn param_jac_mat_prod(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        param: &str,
        mat: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let linear = downcast::<Linear>(module)?;
        param_jac(linear, &sub_input(io, subsampling)?, param, mat)
    }
}

/// Contract of [`ParallelLinear`]: each sibling acts on its own block of
/// output features.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelLinearDerivatives;

/// Split `layers.{i}.{name}` into the sibling index and its parameter name.
pub(crate) fn sibling_param(param: &str) -> Option<(usize, &str)> {
    let (index, name) = param.strip_prefix("layers.")?.split_once('.')?;
    Some((index.parse().ok()?, name))
}

fn sibling<'a>(group: &'a ParallelLinear, param: &'a str) -> Result<(usize, &'a Linear, &'a str), BackpropError> {
    sibling_param(param)
        .and_then(|(i, name)| group.layers().get(i).map(|l| (i, l, name)))
        .ok_or_else(|| unknown(group, param))
}

/// Columns of `mat` (axis 2) belonging to sibling `i`.
pub(crate) fn sibling_block(
    group: &ParallelLinear,
    i: usize,
    mat: &DenseTensor<f64>,
) -> Result<DenseTensor<f64>, BackpropError> {
    if mat.ndim() != 3 || mat.dim(2) != group.out_features() {
        return Err(BackpropError::ShapeMismatch {
            context: "ParallelLinear quantity",
            expected: vec![0, 0, group.out_features()],
            actual: mat.shape().to_vec(),
        });
    }
    let offset = group.offsets()[i];
    Ok(narrow(mat, 2, offset, group.layers()[i].out_features())?)
}

impl Derivatives for ParallelLinearDerivatives {
    fn hessian_is_zero(&self, _module: &dyn Module) -> bool {
        true
    }

    fn jac_t_mat_prod(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        mat: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let group = downcast::<ParallelLinear>(module)?;
        let n = rows(io, subsampling);
        let mut total: Option<DenseTensor<f64>> = None;
        for (i, layer) in group.layers().iter().enumerate() {
            let part = jac_t(layer, &sibling_block(group, i, mat)?, n)?;
            total = Some(match total {
                Some(mut acc) => {
                    crate::operations::add_inplace(&mut acc, &part)?;
                    acc
                }
                None => part,
            });
        }
        total.ok_or_else(|| unknown(module, "layers"))
    }

    fn jac_mat_prod(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        mat: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let group = downcast::<ParallelLinear>(module)?;
        let n = rows(io, subsampling);
        let parts = group
            .layers()
            .iter()
            .map(|layer| jac(layer, mat, n))
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&DenseTensor<f64>> = parts.iter().collect();
        Ok(concat(&refs, 2)?)
    }

    fn param_jac_t_mat_prod(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        param: &str,
        mat: &DenseTensor<f64>,
        sum_batch: bool,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let group = downcast::<ParallelLinear>(module)?;
        let (i, layer, name) = sibling(group, param)?;
        let block = sibling_block(group, i, mat)?;
        param_jac_t(layer, &sub_input(io, subsampling)?, name, &block, sum_batch)
    }

    fn param_jac_mat_prod(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        param: &str,
        mat: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let group = downcast::<ParallelLinear>(module)?;
        let (i, layer, name) = sibling(group, param)?;
        let block = param_jac(layer, &sub_input(io, subsampling)?, name, mat)?;
        let (n, v) = (block.dim(0), block.dim(1));
        let parts: Vec<DenseTensor<f64>> = group
            .layers()
            .iter()
            .enumerate()
            .map(|(j, l)| {
                if j == i {
                    block.clone()
                } else {
                    DenseTensor::zeros(&[n, v, l.out_features()])
                }
            })
            .collect();
        let refs: Vec<&DenseTensor<f64>> = parts.iter().collect();
        Ok(concat(&refs, 2)?)
    }
}
