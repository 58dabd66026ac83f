//! Dense storage for tensor data.
//!
//! The buffer is reference counted: reshapes and clones share it, and the
//! first mutation of a shared buffer copies it.

use std::rc::Rc;

use crate::scalar::Scalar;

/// Dense storage - contiguous array of elements in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Dense<ElT: Scalar> {
    data: Rc<Vec<ElT>>,
}

impl<ElT: Scalar> Dense<ElT> {
    /// Create dense storage with given length, zero-initialized.
    pub fn zeros(len: usize) -> Self {
        Self {
            data: Rc::new(vec![ElT::zero(); len]),
        }
    }

    /// Create dense storage from existing vector (takes ownership).
    pub fn from_vec(data: Vec<ElT>) -> Self {
        Self {
            data: Rc::new(data),
        }
    }

    /// Length of storage.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if storage is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get immutable slice of data.
    #[inline]
    pub fn as_slice(&self) -> &[ElT] {
        &self.data
    }

    /// Get mutable slice of data, detaching from other views first.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [ElT] {
        Rc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Another handle onto the same buffer.
    #[inline]
    pub fn view(&self) -> Self {
        Self {
            data: Rc::clone(&self.data),
        }
    }

    /// `true` if both handles point at the same buffer.
    #[inline]
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    /// `true` if other handles onto this buffer exist.
    #[inline]
    pub fn is_shared(&self) -> bool {
        Rc::strong_count(&self.data) > 1
    }

    /// Take the elements out, copying only if the buffer is shared.
    pub fn into_vec(self) -> Vec<ElT> {
        Rc::try_unwrap(self.data).unwrap_or_else(|shared| shared.as_ref().clone())
    }
}
