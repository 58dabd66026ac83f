//! N-dimensional dense tensor.
//!
//! Data is row-major and reference counted, so reshapes and clones are
//! zero-copy views that detach on first write.

use crate::error::TensorError;
use crate::scalar::Scalar;
use crate::storage::Dense;
use crate::strides::{cartesian_to_linear, compute_strides};

/// An n-dimensional dense tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<ElT: Scalar> {
    storage: Dense<ElT>,
    shape: Vec<usize>,
    strides: Vec<usize>,
}

/// Type alias kept for symmetry with the rest of the crate's signatures.
pub type DenseTensor<ElT> = Tensor<ElT>;

impl<ElT: Scalar> Tensor<ElT> {
    /// Create a new tensor with the given shape, zero-initialized.
    ///
    /// # Examples
    ///
    /// ```
    /// use curvprop::Tensor;
    ///
    /// let t: Tensor<f64> = Tensor::zeros(&[2, 3, 4]);
    /// assert_eq!(t.shape(), &[2, 3, 4]);
    /// assert_eq!(t.len(), 24);
    /// ```
    pub fn zeros(shape: &[usize]) -> Self {
        let len: usize = shape.iter().product();
        Self {
            storage: Dense::zeros(len),
            shape: shape.to_vec(),
            strides: compute_strides(shape),
        }
    }

    /// Create a tensor filled with `value`.
    pub fn full(shape: &[usize], value: ElT) -> Self {
        let len: usize = shape.iter().product();
        Self::from_parts(vec![value; len], shape)
    }

    /// Create a tensor filled with ones.
    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, ElT::one())
    }

    /// Create tensor from row-major data and shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if data length doesn't match shape.
    ///
    /// # Examples
    ///
    /// ```
    /// use curvprop::Tensor;
    ///
    /// let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    /// assert_eq!(t.get(&[0, 1]), Some(&2.0));
    /// assert_eq!(t.get(&[1, 0]), Some(&4.0));
    /// ```
    pub fn from_vec(data: Vec<ElT>, shape: &[usize]) -> Result<Self, TensorError> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(TensorError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self::from_parts(data, shape))
    }

    /// Build a tensor whose `data.len()` the caller already matched to `shape`.
    pub(crate) fn from_parts(data: Vec<ElT>, shape: &[usize]) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Self {
            storage: Dense::from_vec(data),
            shape: shape.to_vec(),
            strides: compute_strides(shape),
        }
    }

    /// Build a tensor by evaluating `f` at every cartesian index.
    pub fn from_fn<F>(shape: &[usize], mut f: F) -> Self
    where
        F: FnMut(&[usize]) -> ElT,
    {
        let len: usize = shape.iter().product();
        let mut data = Vec::with_capacity(len);
        let mut index = vec![0usize; shape.len()];
        for _ in 0..len {
            data.push(f(&index));
            for axis in (0..shape.len()).rev() {
                index[axis] += 1;
                if index[axis] < shape[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        Self::from_parts(data, shape)
    }

    /// Get the shape of the tensor.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Size of one axis.
    ///
    /// # Panics
    ///
    /// Panics if `axis >= ndim`.
    #[inline]
    pub fn dim(&self, axis: usize) -> usize {
        self.shape[axis]
    }

    /// Get the rank (number of dimensions).
    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get total number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Check if tensor is empty (has zero elements).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Get strides.
    #[inline]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Get underlying data as slice.
    #[inline]
    pub fn data(&self) -> &[ElT] {
        self.storage.as_slice()
    }

    /// Get underlying data as mutable slice.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [ElT] {
        self.storage.as_mut_slice()
    }

    /// Consume the tensor and return its row-major elements.
    pub fn into_vec(self) -> Vec<ElT> {
        self.storage.into_vec()
    }

    /// Get element by linear index.
    #[inline]
    pub fn get_linear(&self, i: usize) -> Option<&ElT> {
        self.storage.as_slice().get(i)
    }

    fn checked_offset(&self, indices: &[usize]) -> Result<usize, TensorError> {
        if indices.len() != self.ndim() {
            return Err(TensorError::WrongNumberOfIndices {
                expected: self.ndim(),
                actual: indices.len(),
            });
        }
        for (&idx, &dim) in indices.iter().zip(self.shape.iter()) {
            if idx >= dim {
                return Err(TensorError::IndexOutOfBounds {
                    index: idx,
                    dim_size: dim,
                });
            }
        }
        Ok(cartesian_to_linear(indices, &self.strides))
    }

    /// Get element by cartesian indices.
    ///
    /// Returns `None` if indices are out of bounds or wrong number of indices.
    pub fn get(&self, indices: &[usize]) -> Option<&ElT> {
        let linear = self.checked_offset(indices).ok()?;
        self.get_linear(linear)
    }

    /// Set element by cartesian indices.
    ///
    /// # Errors
    ///
    /// Returns error if indices are out of bounds or wrong number of indices.
    pub fn set(&mut self, indices: &[usize], value: ElT) -> Result<(), TensorError> {
        let linear = self.checked_offset(indices)?;
        self.storage.as_mut_slice()[linear] = value;
        Ok(())
    }

    /// Fill all elements with a value.
    pub fn fill(&mut self, value: ElT) {
        for x in self.storage.as_mut_slice() {
            *x = value;
        }
    }

    /// Reshape the tensor to a new shape (zero-copy view).
    ///
    /// # Errors
    ///
    /// Returns an error if the total number of elements doesn't match.
    ///
    /// # Example
    ///
    /// ```
    /// use curvprop::Tensor;
    ///
    /// let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    /// let t3x2 = t.reshape(&[3, 2]).unwrap();
    /// assert_eq!(t3x2.shape(), &[3, 2]);
    /// assert!(t.shares_storage_with(&t3x2));
    /// ```
    pub fn reshape(&self, new_shape: &[usize]) -> Result<Self, TensorError> {
        let new_len: usize = new_shape.iter().product();
        if self.len() != new_len {
            return Err(TensorError::ShapeMismatch {
                expected: self.len(),
                actual: new_len,
            });
        }

        Ok(Self {
            storage: self.storage.view(),
            shape: new_shape.to_vec(),
            strides: compute_strides(new_shape),
        })
    }

    /// Check if this tensor shares storage with another tensor.
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        self.storage.shares_storage_with(&other.storage)
    }

    /// Check if this tensor's storage is shared with other tensors.
    pub fn is_view(&self) -> bool {
        self.storage.is_shared()
    }

    /// Permute the dimensions of the tensor.
    ///
    /// `perm[i]` gives the source dimension for the i-th dimension of the result.
    ///
    /// # Examples
    ///
    /// ```
    /// use curvprop::Tensor;
    ///
    /// let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    /// let t2 = t.permutedims(&[1, 0]).unwrap();
    /// assert_eq!(t2.shape(), &[3, 2]);
    /// assert_eq!(t.get(&[0, 2]), t2.get(&[2, 0]));
    /// ```
    pub fn permutedims(&self, perm: &[usize]) -> Result<Self, TensorError> {
        crate::operations::permutedims(self, perm)
    }

    /// Largest absolute elementwise difference, or `None` when shapes differ.
    pub fn max_abs_diff(&self, other: &Self) -> Option<f64> {
        if self.shape != other.shape {
            return None;
        }
        let diff = self
            .data()
            .iter()
            .zip(other.data())
            .map(|(&a, &b)| (a.to_f64() - b.to_f64()).abs())
            .fold(0.0, f64::max);
        Some(diff)
    }
}

impl Tensor<f64> {
    /// Zero-dimensional tensor holding `value`.
    pub fn scalar(value: f64) -> Self {
        Self::from_parts(vec![value], &[])
    }
}
