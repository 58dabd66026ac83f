//! Gradient storage container.

use std::collections::HashMap;
use std::hash::Hash;

use crate::error::BackpropError;
use crate::operations::add_inplace;
use crate::tensor::DenseTensor;

/// Gradients keyed by node or parameter, summed over multiple paths.
#[derive(Debug)]
pub(crate) struct Gradients<K> {
    grads: HashMap<K, DenseTensor<f64>>,
}

impl<K: Hash + Eq> Gradients<K> {
    pub(crate) fn new() -> Self {
        Self { grads: HashMap::new() }
    }

    /// Add `grad` to the gradient stored for `key`.
    pub(crate) fn accumulate(&mut self, key: K, grad: DenseTensor<f64>) -> Result<(), BackpropError> {
        if let Some(existing) = self.grads.get_mut(&key) {
            add_inplace(existing, &grad)?;
        } else {
            self.grads.insert(key, grad);
        }
        Ok(())
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<DenseTensor<f64>> {
        self.grads.remove(key)
    }

    pub(crate) fn into_map(self) -> HashMap<K, DenseTensor<f64>> {
        self.grads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_sums_paths() {
        let mut grads = Gradients::new();
        grads.accumulate(1, DenseTensor::ones(&[2])).unwrap();
        grads.accumulate(1, DenseTensor::ones(&[2])).unwrap();
        grads.accumulate(2, DenseTensor::zeros(&[3])).unwrap();
        assert_eq!(grads.remove(&1).unwrap().data(), &[2.0, 2.0]);
        assert!(grads.remove(&1).is_none());
        assert!(grads.accumulate(2, DenseTensor::ones(&[2])).is_err());
        assert_eq!(grads.into_map().len(), 1);
    }
}
