//! Convolutions, through the patch matrix `U[n]: [C_in·K, P]`.
//!
//! `J_Wᵀ S[n, v] = S[n, v] U[n]ᵀ` with `S[n, v]: [C_out, P]`, so the weight
//! diagonal is the linear-layer one with positions contracted before
//! squaring. The bias diagonal is `Σ_v (Σ_p S[n, v, c, p])²`.

use super::{reduce_batch, sum_squares_over_directions};
use crate::derivatives::with_lead;
use crate::error::BackpropError;
use crate::module::Conv;
use crate::operations::{batched_matmul, sum_trailing};
use crate::tensor::DenseTensor;
use crate::unfold::UnfoldMap;

fn check(conv: &Conv, map: &UnfoldMap, n: usize, factor: &DenseTensor<f64>) -> Result<usize, BackpropError> {
    let mut features = vec![conv.out_channels()];
    features.extend_from_slice(map.out_spatial());
    if factor.ndim() != features.len() + 2 || factor.dim(0) != n || factor.shape()[2..] != *features {
        return Err(BackpropError::ShapeMismatch {
            context: "Conv diagonal factor",
            expected: with_lead(&[n, 0], &features),
            actual: factor.shape().to_vec(),
        });
    }
    Ok(factor.dim(1))
}

/// Weight layout if `sum_batch`, else `[N', *weight_shape]`.
///
/// `input` is the already subsampled `[N', C_in, *spatial]`.
pub(crate) fn weight_diagonal(
    conv: &Conv,
    map: &UnfoldMap,
    input: &DenseTensor<f64>,
    factor: &DenseTensor<f64>,
    sum_batch: bool,
) -> Result<DenseTensor<f64>, BackpropError> {
    let n = input.dim(0);
    let v = check(conv, map, n, factor)?;
    let (cout, p, rows) = (conv.out_channels(), map.positions(), map.patch_rows());
    let s = factor.reshape(&[n, v * cout, p])?;
    let js = batched_matmul(&s, &map.unfold(input)?, false, true)?.reshape(&[n, v, cout, rows])?;
    let diag = reduce_batch(sum_squares_over_directions(&js)?, sum_batch)?;
    if sum_batch {
        conv.matrix_to_weight_layout(&diag, &[])
    } else {
        conv.matrix_to_weight_layout(&diag, &[n])
    }
}

/// `[C_out]` if `sum_batch`, else `[N', C_out]`.
pub(crate) fn bias_diagonal(
    conv: &Conv,
    map: &UnfoldMap,
    factor: &DenseTensor<f64>,
    sum_batch: bool,
) -> Result<DenseTensor<f64>, BackpropError> {
    let n = factor.shape().first().copied().unwrap_or(0);
    let v = check(conv, map, n, factor)?;
    let per_position = factor.reshape(&[n, v, conv.out_channels(), map.positions()])?;
    let summed = sum_trailing(&per_position, 3)?;
    reduce_batch(sum_squares_over_directions(&summed)?, sum_batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivatives::ConvDerivatives;
    use crate::diag::via_param_jacobian;
    use crate::module::{ConvOptions, Module, ModuleIo};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn compare(conv: &Conv, input: &[usize], seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = DenseTensor::randn_with_rng(input, &mut rng);
        let io = ModuleIo {
            output: conv.forward(&x).unwrap(),
            input: x.clone(),
        };
        let map = conv.unfold_map(&x).unwrap();
        let factor = DenseTensor::randn_with_rng(&with_lead(&[input[0], 3], &io.output.shape()[1..]), &mut rng);
        for sum_batch in [true, false] {
            let w = weight_diagonal(conv, &map, &x, &factor, sum_batch).unwrap();
            let w_ref =
                via_param_jacobian(&ConvDerivatives, conv, &io, "weight", &factor, sum_batch, None).unwrap();
            assert_eq!(w.shape(), w_ref.shape());
            assert!(w.max_abs_diff(&w_ref).unwrap() < 1e-9);

            let b = bias_diagonal(conv, &map, &factor, sum_batch).unwrap();
            let b_ref = via_param_jacobian(&ConvDerivatives, conv, &io, "bias", &factor, sum_batch, None).unwrap();
            assert!(b.max_abs_diff(&b_ref).unwrap() < 1e-9);
        }
    }

    #[test]
    fn test_conv1d_matches_generic_route() {
        let options = ConvOptions {
            padding: 1,
            ..ConvOptions::default()
        };
        let conv = Conv::conv1d(2, 3, 3, options, true).unwrap();
        compare(&conv, &[4, 2, 6], 30);
    }

    #[test]
    fn test_conv2d_matches_generic_route() {
        let options = ConvOptions {
            stride: 2,
            dilation: 1,
            ..ConvOptions::default()
        };
        let conv = Conv::conv2d(2, 2, [2, 3], options, true).unwrap();
        compare(&conv, &[2, 2, 5, 5], 31);
    }

    #[test]
    fn test_conv_transpose2d_matches_generic_route() {
        let options = ConvOptions {
            stride: 2,
            ..ConvOptions::default()
        };
        let conv = Conv::conv_transpose2d(3, 2, [2, 2], options, true).unwrap();
        compare(&conv, &[2, 3, 3, 2], 32);
    }

    #[test]
    fn test_conv_transpose3d_matches_generic_route() {
        let conv = Conv::conv_transpose3d(1, 2, [2, 1, 2], ConvOptions::default(), true).unwrap();
        compare(&conv, &[2, 1, 2, 2, 2], 33);
    }
}
