//! Summation over axes.

use std::ops::Add;

use crate::error::TensorError;
use crate::scalar::Scalar;
use crate::strides::split_at_axis;
use crate::tensor::DenseTensor;

/// Sum over one axis, removing it from the shape.
///
/// # Errors
///
/// Returns `InvalidAxis` if `axis >= ndim`.
///
/// # Example
///
/// ```
/// use curvprop::Tensor;
/// use curvprop::operations::sum_axis;
///
/// let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
/// assert_eq!(sum_axis(&t, 0).unwrap().data(), &[5.0, 7.0, 9.0]);
/// assert_eq!(sum_axis(&t, 1).unwrap().data(), &[6.0, 15.0]);
/// ```
pub fn sum_axis<ElT: Scalar + Add<Output = ElT>>(
    tensor: &DenseTensor<ElT>,
    axis: usize,
) -> Result<DenseTensor<ElT>, TensorError> {
    if axis >= tensor.ndim() {
        return Err(TensorError::InvalidAxis {
            axis,
            ndim: tensor.ndim(),
        });
    }
    let (outer, extent, inner) = split_at_axis(tensor.shape(), axis);
    let src = tensor.data();
    let mut data = vec![ElT::zero(); outer * inner];
    for o in 0..outer {
        let dst = &mut data[o * inner..(o + 1) * inner];
        for e in 0..extent {
            let base = (o * extent + e) * inner;
            for (d, &s) in dst.iter_mut().zip(&src[base..base + inner]) {
                *d = *d + s;
            }
        }
    }

    let mut shape = tensor.shape().to_vec();
    shape.remove(axis);
    Ok(DenseTensor::from_parts(data, &shape))
}

/// Sum over every axis from `keep` onward; the result has shape `shape[..keep]`.
///
/// # Errors
///
/// Returns `InvalidAxis` if `keep > ndim`.
pub fn sum_trailing<ElT: Scalar + Add<Output = ElT>>(
    tensor: &DenseTensor<ElT>,
    keep: usize,
) -> Result<DenseTensor<ElT>, TensorError> {
    if keep > tensor.ndim() {
        return Err(TensorError::InvalidAxis {
            axis: keep,
            ndim: tensor.ndim(),
        });
    }
    let rows: usize = tensor.shape()[..keep].iter().product();
    let cols: usize = tensor.shape()[keep..].iter().product();
    let data = (0..rows)
        .map(|r| {
            tensor.data()[r * cols..(r + 1) * cols]
                .iter()
                .fold(ElT::zero(), |acc, &x| acc + x)
        })
        .collect();
    Ok(DenseTensor::from_parts(data, &tensor.shape()[..keep]))
}

/// Sum over the first `count` axes; the result has shape `shape[count..]`.
///
/// # Errors
///
/// Returns `InvalidAxis` if `count > ndim`.
pub fn sum_leading<ElT: Scalar + Add<Output = ElT>>(
    tensor: &DenseTensor<ElT>,
    count: usize,
) -> Result<DenseTensor<ElT>, TensorError> {
    if count > tensor.ndim() {
        return Err(TensorError::InvalidAxis {
            axis: count,
            ndim: tensor.ndim(),
        });
    }
    let rows: usize = tensor.shape()[..count].iter().product();
    let cols: usize = tensor.shape()[count..].iter().product();
    let mut data = vec![ElT::zero(); cols];
    for r in 0..rows {
        for (d, &s) in data.iter_mut().zip(&tensor.data()[r * cols..(r + 1) * cols]) {
            *d = *d + s;
        }
    }
    Ok(DenseTensor::from_parts(data, &tensor.shape()[count..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_axis_middle() {
        let t = DenseTensor::from_fn(&[2, 3, 2], |idx| (idx[0] * 100 + idx[1] * 10 + idx[2]) as f64);
        let s = sum_axis(&t, 1).unwrap();
        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.data(), &[30.0, 33.0, 330.0, 333.0]);
        assert!(sum_axis(&t, 3).is_err());
    }

    #[test]
    fn test_sum_trailing_and_leading() {
        let t = DenseTensor::from_fn(&[2, 2, 3], |idx| (idx[0] + idx[1] + idx[2]) as f64);
        assert_eq!(sum_trailing(&t, 1).unwrap().data(), &[12.0, 18.0]);
        assert_eq!(sum_leading(&t, 2).unwrap().data(), &[4.0, 8.0, 12.0]);
        let all = sum_trailing(&t, 0).unwrap();
        assert_eq!(all.ndim(), 0);
        assert_eq!(all.data(), &[30.0]);
    }

    #[test]
    fn test_sum_leading_empty_batch() {
        let t = DenseTensor::<f64>::zeros(&[0, 3]);
        assert_eq!(sum_leading(&t, 1).unwrap().data(), &[0.0, 0.0, 0.0]);
    }
}
