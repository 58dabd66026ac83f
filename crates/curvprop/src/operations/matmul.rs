//! Matrix products through faer's GEMM.

use faer::linalg::matmul::matmul as gemm;
use faer::{Accum, MatMut, MatRef, Par};

use crate::backend::AsFaerMat;
use crate::error::TensorError;
use crate::scalar::Scalar;
use crate::tensor::DenseTensor;

fn matrix_dims(t: &DenseTensor<impl Scalar>, transpose: bool) -> Result<(usize, usize), TensorError> {
    if t.ndim() != 2 {
        return Err(TensorError::RankMismatch {
            expected: 2,
            actual: t.ndim(),
        });
    }
    let (r, c) = (t.dim(0), t.dim(1));
    Ok(if transpose { (c, r) } else { (r, c) })
}

/// `op(a) · op(b)` for 2-D tensors, where `op` optionally transposes.
///
/// # Errors
///
/// Returns `RankMismatch` for non-matrices and `IncompatibleShapes` when the
/// inner dimensions disagree.
///
/// # Example
///
/// ```
/// use curvprop::Tensor;
/// use curvprop::operations::matmul;
///
/// let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
/// let b = Tensor::from_vec(vec![1.0, 0.0, 0.0, 1.0], &[2, 2]).unwrap();
/// assert_eq!(matmul(&a, &b, false, false).unwrap().data(), a.data());
/// assert_eq!(matmul(&a, &b, true, false).unwrap().data(), &[1.0, 3.0, 2.0, 4.0]);
/// ```
pub fn matmul<ElT: Scalar>(
    a: &DenseTensor<ElT>,
    b: &DenseTensor<ElT>,
    transpose_a: bool,
    transpose_b: bool,
) -> Result<DenseTensor<ElT>, TensorError> {
    let (m, k) = matrix_dims(a, transpose_a)?;
    let (k2, n) = matrix_dims(b, transpose_b)?;
    if k != k2 {
        return Err(TensorError::IncompatibleShapes {
            op: "matmul",
            lhs: a.shape().to_vec(),
            rhs: b.shape().to_vec(),
        });
    }

    let a_mat = a.as_faer_mat(a.dim(0), a.dim(1));
    let b_mat = b.as_faer_mat(b.dim(0), b.dim(1));
    let a_mat = if transpose_a { a_mat.transpose() } else { a_mat };
    let b_mat = if transpose_b { b_mat.transpose() } else { b_mat };

    let mut c = DenseTensor::<ElT>::zeros(&[m, n]);
    let mut c_mat = c.as_faer_mat_mut(m, n);

    // C = A * B with beta = Replace, alpha = 1
    gemm(
        c_mat.as_mut(),
        Accum::Replace,
        a_mat,
        b_mat,
        ElT::one(),
        Par::Seq,
    );

    Ok(c)
}

/// Batched `op(a[i]) · op(b[i])` for 3-D tensors `[B, r, c]`.
///
/// # Errors
///
/// Returns `RankMismatch` for non-3-D inputs and `IncompatibleShapes` when
/// batch or inner dimensions disagree.
pub fn batched_matmul<ElT: Scalar>(
    a: &DenseTensor<ElT>,
    b: &DenseTensor<ElT>,
    transpose_a: bool,
    transpose_b: bool,
) -> Result<DenseTensor<ElT>, TensorError> {
    for t in [a, b] {
        if t.ndim() != 3 {
            return Err(TensorError::RankMismatch {
                expected: 3,
                actual: t.ndim(),
            });
        }
    }
    let incompatible = || TensorError::IncompatibleShapes {
        op: "batched_matmul",
        lhs: a.shape().to_vec(),
        rhs: b.shape().to_vec(),
    };
    let batch = a.dim(0);
    if b.dim(0) != batch {
        return Err(incompatible());
    }
    let (ar, ac) = (a.dim(1), a.dim(2));
    let (br, bc) = (b.dim(1), b.dim(2));
    let (m, k) = if transpose_a { (ac, ar) } else { (ar, ac) };
    let (k2, n) = if transpose_b { (bc, br) } else { (br, bc) };
    if k != k2 {
        return Err(incompatible());
    }

    let mut c = DenseTensor::<ElT>::zeros(&[batch, m, n]);
    let (a_step, b_step, c_step) = (ar * ac, br * bc, m * n);
    let c_data = c.data_mut();
    for i in 0..batch {
        let a_mat = MatRef::from_row_major_slice(&a.data()[i * a_step..(i + 1) * a_step], ar, ac);
        let b_mat = MatRef::from_row_major_slice(&b.data()[i * b_step..(i + 1) * b_step], br, bc);
        let a_mat = if transpose_a { a_mat.transpose() } else { a_mat };
        let b_mat = if transpose_b { b_mat.transpose() } else { b_mat };
        let c_mat = MatMut::from_row_major_slice_mut(&mut c_data[i * c_step..(i + 1) * c_step], m, n);
        gemm(c_mat, Accum::Replace, a_mat, b_mat, ElT::one(), Par::Seq);
    }

    Ok(c)
}
