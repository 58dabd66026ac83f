//! Contract for `Conv` (1-3 spatial dims, regular or transposed).
//!
//! All products go through the patch matrix `U[n]: [C_in·K, P]` of the
//! recorded input, so `J_W` is `U[n]ᵀ` acting per output channel and `J` is
//! `fold ∘ W'ᵀ`.

use super::{Derivatives, check_mat, sub_input, with_lead};
use crate::error::BackpropError;
use crate::module::{Conv, Module, ModuleIo, downcast};
use crate::operations::{batched_matmul, concat, narrow, sum_leading, sum_trailing};
use crate::subsampling::subsampled_len;
use crate::tensor::DenseTensor;
use crate::unfold::UnfoldMap;

#[derive(Debug, Clone, Copy, Default)]
pub struct ConvDerivatives;

/// `[C, *spatial]`.
fn feature_shape(channels: usize, spatial: &[usize]) -> Vec<usize> {
    with_lead(&[channels], spatial)
}

fn output_mat(
    conv: &Conv,
    map: &UnfoldMap,
    mat: &DenseTensor<f64>,
    n: usize,
    context: &'static str,
) -> Result<(usize, usize), BackpropError> {
    let batch = with_lead(&[n], &feature_shape(conv.out_channels(), map.out_spatial()));
    check_mat(context, mat, &batch)
}

impl Derivatives for ConvDerivatives {
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
        let conv = downcast::<Conv>(module)?;
        let map = conv.unfold_map(&io.input)?;
        let n = subsampled_len(subsampling, io.input.dim(0));
        let (n, v) = output_mat(conv, &map, mat, n, "Conv jac_t_mat_prod")?;
        let flat = mat.reshape(&[n * v, conv.out_channels(), map.positions()])?;
        let patches = conv.apply_weight_t(&conv.weight_matrix()?, &flat)?;
        let folded = map.fold(&patches)?;
        let shape = with_lead(&[n, v], &feature_shape(conv.in_channels(), map.in_spatial()));
        Ok(folded.reshape(&shape)?)
    }

    fn jac_mat_prod(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        mat: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let conv = downcast::<Conv>(module)?;
        let map = conv.unfold_map(&io.input)?;
        let n = subsampled_len(subsampling, io.input.dim(0));
        let batch = with_lead(&[n], &feature_shape(conv.in_channels(), map.in_spatial()));
        let (n, v) = check_mat("Conv jac_mat_prod", mat, &batch)?;
        let flat = mat.reshape(&with_lead(&[n * v], &batch[1..]))?;
        let y = conv.apply_weight(&conv.weight_matrix()?, &map.unfold(&flat)?)?;
        let shape = with_lead(&[n, v], &feature_shape(conv.out_channels(), map.out_spatial()));
        Ok(y.reshape(&shape)?)
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
        let conv = downcast::<Conv>(module)?;
        let map = conv.unfold_map(&io.input)?;
        let x = sub_input(io, subsampling)?;
        let (n, v) = output_mat(conv, &map, mat, x.dim(0), "Conv param jac_t_mat_prod")?;
        let (cout, p) = (conv.out_channels(), map.positions());
        match (param, conv.bias()) {
            ("weight", _) => {
                let s = mat.reshape(&[n, v * cout, p])?;
                let js = batched_matmul(&s, &map.unfold(&x)?, false, true)?;
                let rows = map.patch_rows();
                if sum_batch {
                    let t = sum_leading(&js, 1)?.reshape(&[v, cout, rows])?;
                    conv.matrix_to_weight_layout(&t, &[v])
                } else {
                    let t = js.reshape(&[n, v, cout, rows])?;
                    conv.matrix_to_weight_layout(&t, &[n, v])
                }
            }
            ("bias", Some(_)) => {
                let per_sample = sum_trailing(&mat.reshape(&[n, v, cout, p])?, 3)?;
                if sum_batch {
                    Ok(sum_leading(&per_sample, 1)?)
                } else {
                    Ok(per_sample)
                }
            }
            _ => Err(BackpropError::UnknownParameter {
                module: module.name(),
                param: param.to_string(),
            }),
        }
    }

    fn param_jac_mat_prod(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        param: &str,
        mat: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let conv = downcast::<Conv>(module)?;
        let map = conv.unfold_map(&io.input)?;
        let x = sub_input(io, subsampling)?;
        let n = x.dim(0);
        let (cout, p) = (conv.out_channels(), map.positions());
        let out_shape = |v: usize| with_lead(&[n, v], &feature_shape(cout, map.out_spatial()));
        let target = match (param, conv.bias()) {
            ("weight", _) => conv.weight().shape(),
            ("bias", Some(b)) => b.shape(),
            _ => {
                return Err(BackpropError::UnknownParameter {
                    module: module.name(),
                    param: param.to_string(),
                });
            }
        };
        if mat.ndim() != target.len() + 1 || mat.shape()[1..] != *target {
            return Err(BackpropError::ShapeMismatch {
                context: "Conv param jac_mat_prod",
                expected: with_lead(&[0], target),
                actual: mat.shape().to_vec(),
            });
        }
        let v = mat.dim(0);

        if param == "bias" {
            let y = DenseTensor::from_fn(&[n, v, cout, p], |i| mat.data()[i[1] * cout + i[2]]);
            return Ok(y.reshape(&out_shape(v))?);
        }

        let weights = conv.weight_layout_to_matrix(mat, &[v])?;
        let patches = map.unfold(&x)?;
        let parts = (0..v)
            .map(|r| -> Result<DenseTensor<f64>, BackpropError> {
                let w = narrow(&weights, 0, r, 1)?.reshape(&[cout, map.patch_rows()])?;
                Ok(conv.apply_weight(&w, &patches)?.reshape(&[n, 1, cout, p])?)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&DenseTensor<f64>> = parts.iter().collect();
        Ok(concat(&refs, 1)?.reshape(&out_shape(v))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ConvOptions;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn dot(a: &DenseTensor<f64>, b: &DenseTensor<f64>) -> f64 {
        a.data().iter().zip(b.data()).map(|(x, y)| x * y).sum()
    }

    fn check_adjoints(conv: &Conv, input: &[usize], rng: &mut StdRng) {
        let x = DenseTensor::randn_with_rng(input, rng);
        let io = ModuleIo {
            output: conv.forward(&x).unwrap(),
            input: x,
        };
        let d = ConvDerivatives;
        let v = 2;
        let mut in_mat = vec![input[0], v];
        in_mat.extend_from_slice(&input[1..]);
        let mut out_mat = vec![input[0], v];
        out_mat.extend_from_slice(&io.output.shape()[1..]);

        let u = DenseTensor::randn_with_rng(&in_mat, rng);
        let w = DenseTensor::randn_with_rng(&out_mat, rng);
        let ju = d.jac_mat_prod(conv, &io, &u, None).unwrap();
        let jtw = d.jac_t_mat_prod(conv, &io, &w, None).unwrap();
        assert_relative_eq!(dot(&ju, &w), dot(&u, &jtw), epsilon = 1e-9);

        for (name, param) in conv.parameters() {
            let mut shape = vec![v];
            shape.extend_from_slice(param.shape());
            let u = DenseTensor::randn_with_rng(&shape, rng);
            let ju = d.param_jac_mat_prod(conv, &io, &name, &u, None).unwrap();
            let jtw = d.param_jac_t_mat_prod(conv, &io, &name, &w, true, None).unwrap();
            assert_relative_eq!(dot(&ju, &w), dot(&u, &jtw), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_conv2d_adjoints() {
        let mut rng = StdRng::seed_from_u64(1);
        let options = ConvOptions {
            stride: 2,
            padding: 1,
            ..ConvOptions::default()
        };
        let conv = Conv::conv2d(2, 3, [3, 2], options, true).unwrap();
        check_adjoints(&conv, &[2, 2, 5, 4], &mut rng);
    }

    #[test]
    fn test_conv_transpose1d_adjoints() {
        let mut rng = StdRng::seed_from_u64(2);
        let options = ConvOptions {
            stride: 2,
            output_padding: 1,
            ..ConvOptions::default()
        };
        let conv = Conv::conv_transpose1d(2, 3, 3, options, true).unwrap();
        check_adjoints(&conv, &[3, 2, 4], &mut rng);
    }

    #[test]
    fn test_conv3d_adjoints() {
        let mut rng = StdRng::seed_from_u64(3);
        let conv = Conv::conv3d(1, 2, [2, 2, 2], ConvOptions::default(), false).unwrap();
        check_adjoints(&conv, &[2, 1, 3, 3, 3], &mut rng);
    }

    #[test]
    fn test_weight_gradient_matches_backward() {
        let mut rng = StdRng::seed_from_u64(4);
        let conv = Conv::conv_transpose2d(2, 2, [2, 2], ConvOptions::default(), true).unwrap();
        let x = DenseTensor::randn_with_rng(&[3, 2, 3, 3], &mut rng);
        let io = ModuleIo {
            output: conv.forward(&x).unwrap(),
            input: x,
        };
        let g = DenseTensor::randn_with_rng(io.output.shape(), &mut rng);
        let grads = conv.backward(&io, &g).unwrap();
        let mut mat_shape = vec![3, 1];
        mat_shape.extend_from_slice(&io.output.shape()[1..]);
        let mat = g.reshape(&mat_shape).unwrap();
        for ((name, _), (_, expected)) in conv.parameters().into_iter().zip(&grads.params) {
            let got = ConvDerivatives
                .param_jac_t_mat_prod(&conv, &io, &name, &mat, true, None)
                .unwrap();
            let got = got.reshape(expected.shape()).unwrap();
            assert!(got.max_abs_diff(expected).unwrap() < 1e-10);
        }
    }
}
