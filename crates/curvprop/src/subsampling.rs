//! Restricting per-sample tensors to a subset of the minibatch.
//!
//! `None` stands for the full batch; `Some(indices)` selects rows in the
//! given order (repeats allowed). Every tensor handled here has the sample
//! axis first.

use crate::error::BackpropError;
use crate::operations::index_select;
use crate::tensor::DenseTensor;

/// Check that every index addresses a row of a batch of `batch_size`.
///
/// # Errors
///
/// `InvalidSubsamplingIndex` for the first offending index.
pub fn validate(indices: Option<&[usize]>, batch_size: usize) -> Result<(), BackpropError> {
    if let Some(&index) = indices.into_iter().flatten().find(|&&i| i >= batch_size) {
        return Err(BackpropError::InvalidSubsamplingIndex { index, batch_size });
    }
    Ok(())
}

/// Number of samples that survive subsampling.
pub fn subsampled_len(indices: Option<&[usize]>, batch_size: usize) -> usize {
    indices.map_or(batch_size, <[usize]>::len)
}

/// Rows of `tensor` selected by `indices`; the full batch shares storage.
///
/// # Errors
///
/// `InvalidSubsamplingIndex` for an index past the batch, `ShapeMismatch`
/// for a 0-d tensor.
pub fn subsample(
    tensor: &DenseTensor<f64>,
    indices: Option<&[usize]>,
) -> Result<DenseTensor<f64>, BackpropError> {
    if tensor.ndim() == 0 {
        return Err(BackpropError::ShapeMismatch {
            context: "subsampled tensor",
            expected: vec![0],
            actual: Vec::new(),
        });
    }
    match indices {
        None => Ok(tensor.clone()),
        Some(rows) => {
            validate(Some(rows), tensor.dim(0))?;
            Ok(index_select(tensor, 0, rows)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_batch_is_shared() {
        let t = DenseTensor::<f64>::ones(&[3, 2]);
        let s = subsample(&t, None).unwrap();
        assert!(s.shares_storage_with(&t));
        assert_eq!(subsampled_len(None, 3), 3);
    }

    #[test]
    fn test_selects_rows_in_order() {
        let t = DenseTensor::from_fn(&[4, 2], |i| (10 * i[0] + i[1]) as f64);
        let s = subsample(&t, Some(&[3, 0, 3])).unwrap();
        assert_eq!(s.shape(), &[3, 2]);
        assert_eq!(s.data(), &[30.0, 31.0, 0.0, 1.0, 30.0, 31.0]);
        assert_eq!(subsampled_len(Some(&[3, 0, 3]), 4), 3);
    }

    #[test]
    fn test_invalid_index() {
        let t = DenseTensor::<f64>::ones(&[4, 2]);
        assert!(matches!(
            subsample(&t, Some(&[1, 4])),
            Err(BackpropError::InvalidSubsamplingIndex {
                index: 4,
                batch_size: 4
            })
        ));
        assert!(validate(Some(&[]), 0).is_ok());
        assert!(validate(None, 0).is_ok());
    }
}
