//! Selection and concatenation along a single axis.

use crate::error::TensorError;
use crate::scalar::Scalar;
use crate::strides::split_at_axis;
use crate::tensor::DenseTensor;

fn check_axis<ElT: Scalar>(tensor: &DenseTensor<ElT>, axis: usize) -> Result<(), TensorError> {
    if axis >= tensor.ndim() {
        return Err(TensorError::InvalidAxis {
            axis,
            ndim: tensor.ndim(),
        });
    }
    Ok(())
}

/// Keep `len` consecutive entries of `axis`, starting at `start`.
///
/// # Errors
///
/// Returns `SliceOutOfBounds` if `start + len` exceeds the axis.
///
/// # Example
///
/// ```
/// use curvprop::Tensor;
/// use curvprop::operations::narrow;
///
/// let t = Tensor::from_vec((0..6).map(f64::from).collect(), &[2, 3]).unwrap();
/// let n = narrow(&t, 1, 1, 2).unwrap();
/// assert_eq!(n.data(), &[1.0, 2.0, 4.0, 5.0]);
/// ```
pub fn narrow<ElT: Scalar>(
    tensor: &DenseTensor<ElT>,
    axis: usize,
    start: usize,
    len: usize,
) -> Result<DenseTensor<ElT>, TensorError> {
    check_axis(tensor, axis)?;
    let size = tensor.dim(axis);
    if start + len > size {
        return Err(TensorError::SliceOutOfBounds {
            start,
            end: start + len,
            dim: axis,
            size,
        });
    }
    if start == 0 && len == size {
        return Ok(tensor.clone());
    }

    let (outer, extent, inner) = split_at_axis(tensor.shape(), axis);
    let src = tensor.data();
    let mut data = Vec::with_capacity(outer * len * inner);
    for o in 0..outer {
        let base = (o * extent + start) * inner;
        data.extend_from_slice(&src[base..base + len * inner]);
    }

    let mut shape = tensor.shape().to_vec();
    shape[axis] = len;
    Ok(DenseTensor::from_parts(data, &shape))
}

/// Gather entries of `axis` at `indices`, in the given order.
///
/// # Errors
///
/// Returns `IndexOutOfBounds` for an index past the end of the axis.
pub fn index_select<ElT: Scalar>(
    tensor: &DenseTensor<ElT>,
    axis: usize,
    indices: &[usize],
) -> Result<DenseTensor<ElT>, TensorError> {
    check_axis(tensor, axis)?;
    let (outer, extent, inner) = split_at_axis(tensor.shape(), axis);
    if let Some(&bad) = indices.iter().find(|&&i| i >= extent) {
        return Err(TensorError::IndexOutOfBounds {
            index: bad,
            dim_size: extent,
        });
    }

    let src = tensor.data();
    let mut data = Vec::with_capacity(outer * indices.len() * inner);
    for o in 0..outer {
        for &i in indices {
            let base = (o * extent + i) * inner;
            data.extend_from_slice(&src[base..base + inner]);
        }
    }

    let mut shape = tensor.shape().to_vec();
    shape[axis] = indices.len();
    Ok(DenseTensor::from_parts(data, &shape))
}

/// Concatenate tensors along `axis`; all other axes must agree.
///
/// # Errors
///
/// Returns `IncompatibleShapes` when off-axis dimensions differ, and
/// `InvalidAxis` for an empty list or an axis past the rank.
pub fn concat<ElT: Scalar>(
    tensors: &[&DenseTensor<ElT>],
    axis: usize,
) -> Result<DenseTensor<ElT>, TensorError> {
    let Some(first) = tensors.first() else {
        return Err(TensorError::InvalidAxis { axis, ndim: 0 });
    };
    check_axis(first, axis)?;
    for t in &tensors[1..] {
        let same_rank = t.ndim() == first.ndim();
        let same_off_axis = same_rank
            && t.shape()
                .iter()
                .zip(first.shape())
                .enumerate()
                .all(|(i, (a, b))| i == axis || a == b);
        if !same_off_axis {
            return Err(TensorError::IncompatibleShapes {
                op: "concat",
                lhs: first.shape().to_vec(),
                rhs: t.shape().to_vec(),
            });
        }
    }

    let total: usize = tensors.iter().map(|t| t.dim(axis)).sum();
    let (outer, _, inner) = split_at_axis(first.shape(), axis);
    let mut data = Vec::with_capacity(outer * total * inner);
    for o in 0..outer {
        for t in tensors {
            let chunk = t.dim(axis) * inner;
            data.extend_from_slice(&t.data()[o * chunk..(o + 1) * chunk]);
        }
    }

    let mut shape = first.shape().to_vec();
    shape[axis] = total;
    Ok(DenseTensor::from_parts(data, &shape))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iota(shape: &[usize]) -> DenseTensor<f64> {
        let len: usize = shape.iter().product();
        DenseTensor::from_vec((0..len).map(|i| i as f64).collect(), shape).unwrap()
    }

    #[test]
    fn test_narrow_out_of_bounds() {
        let t = iota(&[2, 3]);
        assert!(matches!(
            narrow(&t, 1, 2, 2),
            Err(TensorError::SliceOutOfBounds { start: 2, end: 4, dim: 1, size: 3 })
        ));
        assert!(matches!(narrow(&t, 2, 0, 1), Err(TensorError::InvalidAxis { .. })));
    }

    #[test]
    fn test_narrow_full_range_is_view() {
        let t = iota(&[2, 3]);
        assert!(narrow(&t, 0, 0, 2).unwrap().shares_storage_with(&t));
    }

    #[test]
    fn test_index_select_rows() {
        let t = iota(&[3, 2]);
        let s = index_select(&t, 0, &[2, 0, 2]).unwrap();
        assert_eq!(s.shape(), &[3, 2]);
        assert_eq!(s.data(), &[4.0, 5.0, 0.0, 1.0, 4.0, 5.0]);
        assert!(index_select(&t, 0, &[3]).is_err());
        assert_eq!(index_select(&t, 0, &[]).unwrap().shape(), &[0, 2]);
    }

    #[test]
    fn test_concat_inverts_narrow() {
        let t = iota(&[2, 3, 4]);
        let a = narrow(&t, 2, 0, 1).unwrap();
        let b = narrow(&t, 2, 1, 3).unwrap();
        let c = concat(&[&a, &b], 2).unwrap();
        assert_eq!(c, t);
    }

    #[test]
    fn test_concat_incompatible() {
        let a = iota(&[2, 3]);
        let b = iota(&[3, 3]);
        assert!(concat(&[&a, &b], 1).is_err());
        assert!(concat(&[&a, &b], 0).is_ok());
    }
}
