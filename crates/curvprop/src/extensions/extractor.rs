//! Turning a backpropagated factor into per-parameter results.

use std::fmt::Debug;

use crate::derivatives::{Derivatives, sibling_block, sibling_param, sub_input};
use crate::diag::{self, via_param_jacobian};
use crate::engine::PassId;
use crate::error::BackpropError;
use crate::extensions::InputFactor;
use crate::module::{Conv, Linear, MeanInputBuffer, Module, ModuleIo, ParallelLinear, downcast};
use crate::operations::{matmul, scale_inplace, sum_axis};
use crate::tensor::DenseTensor;

/// Everything an extractor needs to know about the node being visited.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Site<'a> {
    pub module: &'a dyn Module,
    pub io: &'a ModuleIo,
    pub pass: PassId,
    pub subsampling: Option<&'a [usize]>,
}

/// Parameter-side half of a layer handler.
pub(crate) trait ParamExtractor: Debug {
    /// Diagonal of `J_θᵀ S Sᵀ J_θ` for parameter `param`.
    fn diagonal(
        &self,
        derivatives: &dyn Derivatives,
        site: Site<'_>,
        param: &str,
        factor: &DenseTensor<f64>,
        sum_batch: bool,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        via_param_jacobian(
            derivatives,
            site.module,
            site.io,
            param,
            factor,
            sum_batch,
            site.subsampling,
        )
    }

    fn supports_kronecker(&self) -> bool {
        false
    }

    /// Kronecker factors of the curvature block of `param`, outermost first.
    fn kronecker_factors(
        &self,
        site: Site<'_>,
        _param: &str,
        _factor: &DenseTensor<f64>,
        _input_factor: InputFactor,
    ) -> Result<Vec<DenseTensor<f64>>, BackpropError> {
        Err(BackpropError::UnsupportedLayer {
            module: site.module.name(),
            extension: "kronecker".to_string(),
        })
    }
}

/// Falls back to the parameter-Jacobian route; used for layers registered
/// by the caller and for parameter-free layers.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct GenericExtractor;

impl ParamExtractor for GenericExtractor {}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LinearExtractor;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ParallelLinearExtractor;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ConvExtractor;

fn unknown(module: &dyn Module, param: &str) -> BackpropError {
    BackpropError::UnknownParameter {
        module: module.name(),
        param: param.to_string(),
    }
}

fn linear_diagonal(
    input: &DenseTensor<f64>,
    name: &str,
    has_bias: bool,
    factor: &DenseTensor<f64>,
    sum_batch: bool,
) -> Option<Result<DenseTensor<f64>, BackpropError>> {
    match name {
        "weight" => Some(diag::linear::weight_diagonal(input, factor, sum_batch)),
        "bias" if has_bias => Some(diag::linear::bias_diagonal(factor, sum_batch)),
        _ => None,
    }
}

impl ParamExtractor for LinearExtractor {
    fn diagonal(
        &self,
        _derivatives: &dyn Derivatives,
        site: Site<'_>,
        param: &str,
        factor: &DenseTensor<f64>,
        sum_batch: bool,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let linear = downcast::<Linear>(site.module)?;
        let input = sub_input(site.io, site.subsampling)?;
        linear_diagonal(&input, param, linear.has_bias(), factor, sum_batch)
            .unwrap_or_else(|| Err(unknown(site.module, param)))
    }

    fn supports_kronecker(&self) -> bool {
        true
    }

    fn kronecker_factors(
        &self,
        site: Site<'_>,
        param: &str,
        factor: &DenseTensor<f64>,
        input_factor: InputFactor,
    ) -> Result<Vec<DenseTensor<f64>>, BackpropError> {
        let linear = downcast::<Linear>(site.module)?;
        let g = output_factor(factor)?;
        match param {
            "weight" => {
                let a = input_side(site, linear.mean_input().map(|b| &**b), input_factor)?;
                Ok(vec![g, a])
            }
            "bias" if linear.has_bias() => Ok(vec![g]),
            _ => Err(unknown(site.module, param)),
        }
    }
}

impl ParamExtractor for ParallelLinearExtractor {
    fn diagonal(
        &self,
        _derivatives: &dyn Derivatives,
        site: Site<'_>,
        param: &str,
        factor: &DenseTensor<f64>,
        sum_batch: bool,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let group = downcast::<ParallelLinear>(site.module)?;
        let (i, name) = sibling_param(param).ok_or_else(|| unknown(site.module, param))?;
        let layer = group.layers().get(i).ok_or_else(|| unknown(site.module, param))?;
        let block = sibling_block(group, i, factor)?;
        let input = sub_input(site.io, site.subsampling)?;
        linear_diagonal(&input, name, layer.has_bias(), &block, sum_batch)
            .unwrap_or_else(|| Err(unknown(site.module, param)))
    }

    fn supports_kronecker(&self) -> bool {
        true
    }

    fn kronecker_factors(
        &self,
        site: Site<'_>,
        param: &str,
        factor: &DenseTensor<f64>,
        input_factor: InputFactor,
    ) -> Result<Vec<DenseTensor<f64>>, BackpropError> {
        let group = downcast::<ParallelLinear>(site.module)?;
        let (i, name) = sibling_param(param).ok_or_else(|| unknown(site.module, param))?;
        let layer = group.layers().get(i).ok_or_else(|| unknown(site.module, param))?;
        let g = output_factor(&sibling_block(group, i, factor)?)?;
        match name {
            "weight" => {
                let a = input_side(site, Some(&**group.mean_input()), input_factor)?;
                Ok(vec![g, a])
            }
            "bias" if layer.has_bias() => Ok(vec![g]),
            _ => Err(unknown(site.module, param)),
        }
    }
}

impl ParamExtractor for ConvExtractor {
    fn diagonal(
        &self,
        _derivatives: &dyn Derivatives,
        site: Site<'_>,
        param: &str,
        factor: &DenseTensor<f64>,
        sum_batch: bool,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let conv = downcast::<Conv>(site.module)?;
        let map = conv.unfold_map(&site.io.input)?;
        match (param, conv.bias()) {
            ("weight", _) => {
                let input = sub_input(site.io, site.subsampling)?;
                diag::conv::weight_diagonal(conv, &map, &input, factor, sum_batch)
            }
            ("bias", Some(_)) => diag::conv::bias_diagonal(conv, &map, factor, sum_batch),
            _ => Err(unknown(site.module, param)),
        }
    }
}

/// `G = Σ_n Σ_v s sᵀ` for `S: [N', V, out]`.
fn output_factor(factor: &DenseTensor<f64>) -> Result<DenseTensor<f64>, BackpropError> {
    if factor.ndim() != 3 {
        return Err(BackpropError::ShapeMismatch {
            context: "Kronecker output factor",
            expected: vec![0, 0, 0],
            actual: factor.shape().to_vec(),
        });
    }
    let rows = factor.reshape(&[factor.dim(0) * factor.dim(1), factor.dim(2)])?;
    Ok(matmul(&rows, &rows, true, false)?)
}

/// Input-side factor `A` of a fully connected layer.
///
/// `MeanInput` reads the shared buffer when it was written from this node's
/// input during this pass and the whole batch is used; otherwise the mean is
/// taken over the node's own (subsampled) rows.
fn input_side(
    site: Site<'_>,
    buffer: Option<&MeanInputBuffer>,
    input_factor: InputFactor,
) -> Result<DenseTensor<f64>, BackpropError> {
    let x = sub_input(site.io, site.subsampling)?;
    let n = x.dim(0).max(1) as f64;
    match input_factor {
        InputFactor::SecondMoment => {
            let mut a = matmul(&x, &x, true, false)?;
            scale_inplace(&mut a, 1.0 / n);
            Ok(a)
        }
        InputFactor::MeanInput => {
            let buffered = buffer
                .filter(|_| site.subsampling.is_none())
                .and_then(|b| b.mean_of(site.pass, &site.io.input));
            let mean = match buffered {
                Some(mean) => mean,
                None => {
                    let mut mean = sum_axis(&x, 0)?;
                    scale_inplace(&mut mean, 1.0 / n);
                    mean
                }
            };
            let column = mean.reshape(&[mean.len(), 1])?;
            Ok(matmul(&column, &column, false, true)?)
        }
    }
}
