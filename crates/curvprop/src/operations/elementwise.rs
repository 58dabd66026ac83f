//! Element-wise tensor operations.

use std::ops::{Add, Mul};

use crate::error::TensorError;
use crate::scalar::Scalar;
use crate::tensor::DenseTensor;

/// Scale tensor by a scalar value, returning a new tensor.
///
/// # Example
///
/// ```
/// use curvprop::Tensor;
/// use curvprop::operations::scale;
///
/// let t = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3]).unwrap();
/// assert_eq!(scale(&t, 2.0).data(), &[2.0, 4.0, 6.0]);
/// ```
pub fn scale<ElT: Scalar + Mul<Output = ElT>>(
    tensor: &DenseTensor<ElT>,
    alpha: ElT,
) -> DenseTensor<ElT> {
    apply(tensor, |x| alpha * x)
}

/// Scale tensor in-place by a scalar value.
pub fn scale_inplace<ElT: Scalar + Mul<Output = ElT>>(tensor: &mut DenseTensor<ElT>, alpha: ElT) {
    apply_inplace(tensor, |x| alpha * x);
}

/// Element-wise square.
pub fn square<ElT: Scalar + Mul<Output = ElT>>(tensor: &DenseTensor<ElT>) -> DenseTensor<ElT> {
    apply(tensor, |x| x * x)
}

/// Apply a function element-wise, returning a new tensor.
pub fn apply<ElT: Scalar, F>(tensor: &DenseTensor<ElT>, f: F) -> DenseTensor<ElT>
where
    F: Fn(ElT) -> ElT,
{
    let data: Vec<ElT> = tensor.data().iter().map(|&x| f(x)).collect();
    DenseTensor::from_parts(data, tensor.shape())
}

/// Apply a function element-wise in-place.
pub fn apply_inplace<ElT: Scalar, F>(tensor: &mut DenseTensor<ElT>, f: F)
where
    F: Fn(ElT) -> ElT,
{
    for x in tensor.data_mut() {
        *x = f(*x);
    }
}

/// Apply a binary function element-wise to two tensors of identical shape.
///
/// # Errors
///
/// Returns `TensorError::IncompatibleShapes` if shapes differ.
pub fn apply_binary<ElT: Scalar, F>(
    a: &DenseTensor<ElT>,
    b: &DenseTensor<ElT>,
    f: F,
) -> Result<DenseTensor<ElT>, TensorError>
where
    F: Fn(ElT, ElT) -> ElT,
{
    if a.shape() != b.shape() {
        return Err(TensorError::IncompatibleShapes {
            op: "apply_binary",
            lhs: a.shape().to_vec(),
            rhs: b.shape().to_vec(),
        });
    }
    let data: Vec<ElT> = a
        .data()
        .iter()
        .zip(b.data())
        .map(|(&x, &y)| f(x, y))
        .collect();
    Ok(DenseTensor::from_parts(data, a.shape()))
}

/// Element-wise sum.
pub fn add<ElT: Scalar + Add<Output = ElT>>(
    a: &DenseTensor<ElT>,
    b: &DenseTensor<ElT>,
) -> Result<DenseTensor<ElT>, TensorError> {
    apply_binary(a, b, |x, y| x + y)
}

/// Accumulate `b` into `a`.
pub fn add_inplace<ElT: Scalar + Add<Output = ElT>>(
    a: &mut DenseTensor<ElT>,
    b: &DenseTensor<ElT>,
) -> Result<(), TensorError> {
    if a.shape() != b.shape() {
        return Err(TensorError::IncompatibleShapes {
            op: "add_inplace",
            lhs: a.shape().to_vec(),
            rhs: b.shape().to_vec(),
        });
    }
    for (x, &y) in a.data_mut().iter_mut().zip(b.data()) {
        *x = *x + y;
    }
    Ok(())
}

/// Element-wise (Hadamard) product.
pub fn mul<ElT: Scalar + Mul<Output = ElT>>(
    a: &DenseTensor<ElT>,
    b: &DenseTensor<ElT>,
) -> Result<DenseTensor<ElT>, TensorError> {
    apply_binary(a, b, |x, y| x * y)
}

/// Embed the trailing axes of `[N, *feature]` as a diagonal: `[N, F, *feature]`
/// with `F = prod(feature)` and `out[n, f, g] = δ_fg · t[n, g]`.
///
/// # Errors
///
/// Returns `TensorError::RankMismatch` for a 0-d tensor.
pub fn diag_embed<ElT: Scalar>(tensor: &DenseTensor<ElT>) -> Result<DenseTensor<ElT>, TensorError> {
    if tensor.ndim() == 0 {
        return Err(TensorError::RankMismatch {
            expected: 1,
            actual: 0,
        });
    }
    let n = tensor.dim(0);
    let features: usize = tensor.shape()[1..].iter().product();
    let mut data = vec![ElT::zero(); n * features * features];
    let src = tensor.data();
    for b in 0..n {
        for f in 0..features {
            data[(b * features + f) * features + f] = src[b * features + f];
        }
    }
    let mut shape = vec![n, features];
    shape.extend_from_slice(&tensor.shape()[1..]);
    Ok(DenseTensor::from_parts(data, &shape))
}
