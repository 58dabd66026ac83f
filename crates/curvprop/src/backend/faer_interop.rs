//! Zero-copy conversion between tensors and faer matrices.
//!
//! # Memory Layout
//!
//! Tensors are row-major, so a tensor of `rows * cols` elements is viewed as
//! a faer matrix with row stride `cols` and column stride 1.

use faer::{MatMut, MatRef};

use crate::scalar::Scalar;
use crate::tensor::DenseTensor;

/// Extension trait for converting a dense tensor to faer matrix views.
pub trait AsFaerMat<T: Scalar> {
    /// View tensor data as an immutable row-major faer matrix.
    ///
    /// # Panics
    ///
    /// Panics if `rows * cols != tensor.len()`.
    ///
    /// # Example
    ///
    /// ```
    /// use curvprop::Tensor;
    /// use curvprop::backend::AsFaerMat;
    ///
    /// let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    /// let mat = t.as_faer_mat(2, 3);
    /// assert_eq!(mat.nrows(), 2);
    /// assert_eq!(mat[(0, 1)], 2.0);
    /// ```
    fn as_faer_mat(&self, rows: usize, cols: usize) -> MatRef<'_, T>;

    /// View tensor data as a mutable row-major faer matrix.
    ///
    /// # Panics
    ///
    /// Panics if `rows * cols != tensor.len()`.
    fn as_faer_mat_mut(&mut self, rows: usize, cols: usize) -> MatMut<'_, T>;
}

impl<T: Scalar> AsFaerMat<T> for DenseTensor<T> {
    fn as_faer_mat(&self, rows: usize, cols: usize) -> MatRef<'_, T> {
        assert_eq!(
            rows * cols,
            self.len(),
            "Matrix dimensions ({} x {} = {}) must match tensor size ({})",
            rows,
            cols,
            rows * cols,
            self.len()
        );
        MatRef::from_row_major_slice(self.data(), rows, cols)
    }

    fn as_faer_mat_mut(&mut self, rows: usize, cols: usize) -> MatMut<'_, T> {
        assert_eq!(
            rows * cols,
            self.len(),
            "Matrix dimensions ({} x {} = {}) must match tensor size ({})",
            rows,
            cols,
            rows * cols,
            self.len()
        );
        MatMut::from_row_major_slice_mut(self.data_mut(), rows, cols)
    }
}

/// Create a `[rows, cols]` tensor from a faer matrix (copies data).
///
/// # Example
///
/// ```
/// use faer::Mat;
/// use curvprop::backend::tensor_from_faer_mat;
///
/// let mat = Mat::from_fn(2, 3, |i, j| (i * 3 + j) as f64);
/// let tensor = tensor_from_faer_mat(mat.as_ref());
/// assert_eq!(tensor.data(), &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
/// ```
pub fn tensor_from_faer_mat<T: Scalar>(mat: MatRef<'_, T>) -> DenseTensor<T> {
    let rows = mat.nrows();
    let cols = mat.ncols();

    let mut data = Vec::with_capacity(rows * cols);
    for i in 0..rows {
        for j in 0..cols {
            data.push(mat[(i, j)]);
        }
    }

    DenseTensor::from_parts(data, &[rows, cols])
}
