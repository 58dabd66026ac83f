//! Permutation of tensor axes.

use crate::error::TensorError;
use crate::scalar::Scalar;
use crate::strides::compute_strides;
use crate::tensor::DenseTensor;

/// Permute the dimensions of a tensor, returning a new tensor.
///
/// `perm[i]` gives the source dimension for the i-th dimension of the result.
///
/// # Errors
///
/// Returns error if `perm` is not a valid permutation of `0..ndim`.
///
/// # Examples
///
/// ```
/// use curvprop::DenseTensor;
/// use curvprop::operations::permutedims;
///
/// let t: DenseTensor<f64> = DenseTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
/// let t2 = permutedims(&t, &[1, 0]).unwrap();
/// assert_eq!(t2.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
/// ```
pub fn permutedims<T: Scalar>(
    tensor: &DenseTensor<T>,
    perm: &[usize],
) -> Result<DenseTensor<T>, TensorError> {
    validate_permutation(perm, tensor.ndim())?;

    if perm.iter().enumerate().all(|(i, &p)| i == p) {
        return Ok(tensor.clone());
    }

    let new_shape: Vec<usize> = perm.iter().map(|&p| tensor.shape()[p]).collect();
    let src_strides = compute_strides(tensor.shape());
    // Stride in the source buffer for a unit step along each result axis.
    let walk: Vec<usize> = perm.iter().map(|&p| src_strides[p]).collect();

    let src = tensor.data();
    let mut data = Vec::with_capacity(tensor.len());
    let mut index = vec![0usize; new_shape.len()];
    let mut offset = 0usize;
    for _ in 0..tensor.len() {
        data.push(src[offset]);
        for axis in (0..new_shape.len()).rev() {
            index[axis] += 1;
            offset += walk[axis];
            if index[axis] < new_shape[axis] {
                break;
            }
            offset -= walk[axis] * new_shape[axis];
            index[axis] = 0;
        }
    }

    Ok(DenseTensor::from_parts(data, &new_shape))
}

/// Validate that perm is a valid permutation of 0..ndim.
fn validate_permutation(perm: &[usize], ndim: usize) -> Result<(), TensorError> {
    if perm.len() != ndim {
        return Err(TensorError::InvalidPermutation {
            perm: perm.to_vec(),
            ndim,
        });
    }

    let mut seen = vec![false; ndim];
    for &p in perm {
        if p >= ndim || seen[p] {
            return Err(TensorError::InvalidPermutation {
                perm: perm.to_vec(),
                ndim,
            });
        }
        seen[p] = true;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permutedims_3d() {
        let t: DenseTensor<f64> = DenseTensor::from_fn(&[2, 3, 4], |idx| {
            (100 * idx[0] + 10 * idx[1] + idx[2]) as f64
        });
        let p = permutedims(&t, &[2, 0, 1]).unwrap();
        assert_eq!(p.shape(), &[4, 2, 3]);
        for i in 0..2 {
            for j in 0..3 {
                for k in 0..4 {
                    assert_eq!(t.get(&[i, j, k]), p.get(&[k, i, j]));
                }
            }
        }
    }

    #[test]
    fn test_identity_permutation_shares_storage() {
        let t = DenseTensor::<f64>::ones(&[2, 3]);
        let p = permutedims(&t, &[0, 1]).unwrap();
        assert!(t.shares_storage_with(&p));
    }

    #[test]
    fn test_invalid_permutation() {
        let t = DenseTensor::<f64>::zeros(&[2, 3]);
        assert!(permutedims(&t, &[0]).is_err());
        assert!(permutedims(&t, &[0, 0]).is_err());
        assert!(permutedims(&t, &[0, 2]).is_err());
    }

    #[test]
    fn test_permutedims_with_empty_axis() {
        let t = DenseTensor::<f64>::zeros(&[0, 3]);
        let p = permutedims(&t, &[1, 0]).unwrap();
        assert_eq!(p.shape(), &[3, 0]);
        assert!(p.is_empty());
    }
}
