//! Patch extraction ("unfold") for convolutions.
//!
//! Both regular and transposed convolutions are written as
//! `Y[n] = W' · U[n]` where `W'` is the weight reshaped to `[C_out, C_in·K]`
//! and `U[n]` is `[C_in·K, P]` with `K` kernel taps and `P` output positions.
//! An [`UnfoldMap`] records, for every (tap, output position) pair, which
//! input position feeds it, so `unfold` is a gather and `fold` its adjoint
//! scatter-add.

use crate::error::BackpropError;
use crate::strides::linear_to_cartesian;
use crate::tensor::DenseTensor;

/// Convolution hyperparameters shared by all spatial dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
    pub output_padding: usize,
    pub transposed: bool,
}

impl ConvGeometry {
    /// Output spatial size for one dimension, or `None` if it would be empty.
    pub fn output_size(&self, input: usize, kernel: usize) -> Option<usize> {
        let span = self.dilation * (kernel - 1);
        if self.transposed {
            let full = (input.checked_sub(1)? * self.stride) + span + self.output_padding + 1;
            full.checked_sub(2 * self.padding).filter(|&o| o > 0)
        } else {
            let padded = input + 2 * self.padding;
            let reach = padded.checked_sub(span + 1)?;
            Some(reach / self.stride + 1)
        }
    }

    /// Input coordinate feeding output coordinate `out` through tap `k`.
    fn source(&self, out: usize, k: usize, input: usize) -> Option<usize> {
        let offset = k * self.dilation;
        if self.transposed {
            let shifted = (out + self.padding).checked_sub(offset)?;
            if shifted % self.stride != 0 {
                return None;
            }
            Some(shifted / self.stride).filter(|&i| i < input)
        } else {
            (out * self.stride + offset)
                .checked_sub(self.padding)
                .filter(|&i| i < input)
        }
    }
}

/// Precomputed gather pattern between an input and its patch matrix.
#[derive(Debug, Clone)]
pub struct UnfoldMap {
    channels: usize,
    kernel_numel: usize,
    in_spatial: Vec<usize>,
    out_spatial: Vec<usize>,
    /// `taps[k * P + p]`: flat input position for tap `k` at output position `p`.
    taps: Vec<Option<usize>>,
}

impl UnfoldMap {
    /// Build the map for `channels` input channels of spatial size `in_spatial`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if the output would be empty.
    pub fn new(
        geometry: &ConvGeometry,
        channels: usize,
        kernel: &[usize],
        in_spatial: &[usize],
    ) -> Result<Self, BackpropError> {
        let out_spatial = in_spatial
            .iter()
            .zip(kernel)
            .map(|(&i, &k)| geometry.output_size(i, k))
            .collect::<Option<Vec<usize>>>()
            .ok_or_else(|| {
                BackpropError::InvalidConfiguration(format!(
                    "convolution with kernel {kernel:?} produces an empty output for input {in_spatial:?}"
                ))
            })?;

        let kernel_numel: usize = kernel.iter().product();
        let positions: usize = out_spatial.iter().product();
        let mut taps = Vec::with_capacity(kernel_numel * positions);
        for k in 0..kernel_numel {
            let k_idx = linear_to_cartesian(k, kernel);
            for p in 0..positions {
                let o_idx = linear_to_cartesian(p, &out_spatial);
                let mut flat = 0usize;
                let mut valid = true;
                for d in 0..kernel.len() {
                    match geometry.source(o_idx[d], k_idx[d], in_spatial[d]) {
                        Some(i) => flat = flat * in_spatial[d] + i,
                        None => {
                            valid = false;
                            break;
                        }
                    }
                }
                taps.push(valid.then_some(flat));
            }
        }

        Ok(Self {
            channels,
            kernel_numel,
            in_spatial: in_spatial.to_vec(),
            out_spatial,
            taps,
        })
    }

    pub fn out_spatial(&self) -> &[usize] {
        &self.out_spatial
    }

    pub fn in_spatial(&self) -> &[usize] {
        &self.in_spatial
    }

    /// Number of output positions `P`.
    pub fn positions(&self) -> usize {
        self.out_spatial.iter().product()
    }

    fn in_numel(&self) -> usize {
        self.in_spatial.iter().product()
    }

    /// Rows of the patch matrix, `C_in · K`.
    pub fn patch_rows(&self) -> usize {
        self.channels * self.kernel_numel
    }

    /// `[M, C_in, *in_spatial]` to `[M, C_in·K, P]`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the element count does not match `M` inputs.
    pub fn unfold(&self, input: &DenseTensor<f64>) -> Result<DenseTensor<f64>, BackpropError> {
        let per_sample = self.channels * self.in_numel();
        let m = self.batch_of(input, per_sample, "unfold input")?;
        let positions = self.positions();
        let rows = self.patch_rows();
        let src = input.data();
        let mut data = vec![0.0; m * rows * positions];
        for n in 0..m {
            for c in 0..self.channels {
                let x = &src[n * per_sample + c * self.in_numel()..][..self.in_numel()];
                for k in 0..self.kernel_numel {
                    let row = (n * rows + c * self.kernel_numel + k) * positions;
                    let taps = &self.taps[k * positions..(k + 1) * positions];
                    for (dst, tap) in data[row..row + positions].iter_mut().zip(taps) {
                        if let Some(i) = tap {
                            *dst = x[*i];
                        }
                    }
                }
            }
        }
        Ok(DenseTensor::from_parts(data, &[m, rows, positions]))
    }

    /// Adjoint of [`UnfoldMap::unfold`]: `[M, C_in·K, P]` to `[M, C_in, *in_spatial]`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the element count does not match `M` patch matrices.
    pub fn fold(&self, patches: &DenseTensor<f64>) -> Result<DenseTensor<f64>, BackpropError> {
        let positions = self.positions();
        let rows = self.patch_rows();
        let m = self.batch_of(patches, rows * positions, "fold patches")?;
        let in_numel = self.in_numel();
        let src = patches.data();
        let mut data = vec![0.0; m * self.channels * in_numel];
        for n in 0..m {
            for c in 0..self.channels {
                let x = &mut data[(n * self.channels + c) * in_numel..][..in_numel];
                for k in 0..self.kernel_numel {
                    let row = (n * rows + c * self.kernel_numel + k) * positions;
                    let taps = &self.taps[k * positions..(k + 1) * positions];
                    for (&v, tap) in src[row..row + positions].iter().zip(taps) {
                        if let Some(i) = tap {
                            x[*i] += v;
                        }
                    }
                }
            }
        }
        let mut shape = vec![m, self.channels];
        shape.extend_from_slice(&self.in_spatial);
        Ok(DenseTensor::from_parts(data, &shape))
    }

    fn batch_of(
        &self,
        t: &DenseTensor<f64>,
        per_sample: usize,
        context: &'static str,
    ) -> Result<usize, BackpropError> {
        if per_sample == 0 || t.len() % per_sample != 0 {
            return Err(BackpropError::ShapeMismatch {
                context,
                expected: vec![per_sample],
                actual: t.shape().to_vec(),
            });
        }
        Ok(t.len() / per_sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn geometry(stride: usize, padding: usize, dilation: usize, transposed: bool) -> ConvGeometry {
        ConvGeometry {
            stride,
            padding,
            dilation,
            output_padding: 0,
            transposed,
        }
    }

    #[test]
    fn test_output_size() {
        let g = geometry(2, 1, 1, false);
        assert_eq!(g.output_size(5, 3), Some(3));
        assert_eq!(geometry(1, 0, 2, false).output_size(5, 3), Some(1));
        assert_eq!(geometry(1, 0, 1, false).output_size(2, 3), None);
        assert_eq!(geometry(2, 1, 1, true).output_size(3, 3), Some(5));
    }

    #[test]
    fn test_unfold_1d_no_padding() {
        let g = geometry(1, 0, 1, false);
        let map = UnfoldMap::new(&g, 1, &[2], &[4]).unwrap();
        let x = DenseTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[1, 1, 4]).unwrap();
        let u = map.unfold(&x).unwrap();
        assert_eq!(u.shape(), &[1, 2, 3]);
        assert_eq!(u.data(), &[1.0, 2.0, 3.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_unfold_padding_zeros() {
        let g = geometry(1, 1, 1, false);
        let map = UnfoldMap::new(&g, 1, &[3], &[2]).unwrap();
        let x = DenseTensor::from_vec(vec![5.0, 7.0], &[1, 1, 2]).unwrap();
        let u = map.unfold(&x).unwrap();
        assert_eq!(u.data(), &[0.0, 5.0, 5.0, 7.0, 7.0, 0.0]);
    }

    #[test]
    fn test_fold_is_adjoint_of_unfold() {
        let g = geometry(2, 1, 1, false);
        let map = UnfoldMap::new(&g, 2, &[2, 3], &[4, 5]).unwrap();
        let x = DenseTensor::from_fn(&[2, 2, 4, 5], |i| (i[0] + 2 * i[1] + i[2] * i[3]) as f64 * 0.1);
        let u = map.unfold(&x).unwrap();
        let y = DenseTensor::from_fn(u.shape(), |i| ((i[1] * 7 + i[2] * 3) % 5) as f64 - 2.0);
        let lhs: f64 = u.data().iter().zip(y.data()).map(|(a, b)| a * b).sum();
        let folded = map.fold(&y).unwrap();
        let rhs: f64 = x.data().iter().zip(folded.data()).map(|(a, b)| a * b).sum();
        assert_relative_eq!(lhs, rhs, epsilon = 1e-12);
    }

    #[test]
    fn test_transposed_unfold_matches_scatter() {
        // Transposed 1-d convolution of [1, 2] with stride 2 and kernel 2 places
        // each input at two consecutive output positions.
        let g = geometry(2, 0, 1, true);
        let map = UnfoldMap::new(&g, 1, &[2], &[2]).unwrap();
        assert_eq!(map.out_spatial(), &[4]);
        let x = DenseTensor::from_vec(vec![1.0, 2.0], &[1, 1, 2]).unwrap();
        let u = map.unfold(&x).unwrap();
        assert_eq!(u.data(), &[1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 0.0, 2.0]);
    }

    #[test]
    fn test_unfold_shape_mismatch() {
        let g = geometry(1, 0, 1, false);
        let map = UnfoldMap::new(&g, 2, &[2], &[4]).unwrap();
        let x = DenseTensor::<f64>::zeros(&[1, 1, 4]);
        assert!(matches!(
            map.unfold(&x),
            Err(BackpropError::ShapeMismatch { .. })
        ));
    }
}
