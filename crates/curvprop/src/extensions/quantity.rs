//! Backpropagated square-root factors.

use crate::engine::NodeId;
use crate::error::BackpropError;
use crate::operations::{add_inplace, concat};
use crate::tensor::DenseTensor;

/// Whether a factor adds or subtracts its outer product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sign {
    Plus,
    Minus,
}

impl Sign {
    pub fn value(self) -> f64 {
        match self {
            Sign::Plus => 1.0,
            Sign::Minus => -1.0,
        }
    }
}

/// One factor `S: [N', V, *features]`, representing `sign · Σ_v S Sᵀ`.
#[derive(Debug, Clone)]
pub struct SignedFactor {
    /// Node that created the factor (the loss, or a layer's residual).
    pub origin: NodeId,
    pub sign: Sign,
    pub tensor: DenseTensor<f64>,
}

/// The curvature square root attached to one edge of the graph.
///
/// For the GGN this is a single factor started at the loss; Hessian
/// diagonals add a pair of factors at every layer with a non-zero residual.
#[derive(Debug, Clone, Default)]
pub struct Quantity {
    factors: Vec<SignedFactor>,
}

impl Quantity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(origin: NodeId, tensor: DenseTensor<f64>) -> Self {
        Self {
            factors: vec![SignedFactor {
                origin,
                sign: Sign::Plus,
                tensor,
            }],
        }
    }

    pub fn factors(&self) -> &[SignedFactor] {
        &self.factors
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn push(&mut self, factor: SignedFactor) {
        self.factors.push(factor);
    }

    /// Map every factor through `f`, keeping origins and signs.
    pub fn try_map<F>(&self, mut f: F) -> Result<Quantity, BackpropError>
    where
        F: FnMut(&DenseTensor<f64>) -> Result<DenseTensor<f64>, BackpropError>,
    {
        let factors = self
            .factors
            .iter()
            .map(|sf| {
                Ok(SignedFactor {
                    origin: sf.origin,
                    sign: sf.sign,
                    tensor: f(&sf.tensor)?,
                })
            })
            .collect::<Result<Vec<_>, BackpropError>>()?;
        Ok(Quantity { factors })
    }

    /// Fold in the quantity arriving from another consumer of the same
    /// tensor. Factors of one origin and sign reached the node along
    /// different paths and are summed; all others are kept side by side.
    pub fn merge(&mut self, other: Quantity) -> Result<(), BackpropError> {
        for incoming in other.factors {
            let existing = self
                .factors
                .iter_mut()
                .find(|f| f.origin == incoming.origin && f.sign == incoming.sign);
            match existing {
                Some(f) => add_inplace(&mut f.tensor, &incoming.tensor)?,
                None => self.factors.push(incoming),
            }
        }
        Ok(())
    }

    /// All positive factors stacked along the direction axis.
    ///
    /// Returns `None` when there is no positive factor.
    pub fn stacked_positive(&self) -> Result<Option<DenseTensor<f64>>, BackpropError> {
        let parts: Vec<&DenseTensor<f64>> = self
            .factors
            .iter()
            .filter(|f| f.sign == Sign::Plus)
            .map(|f| &f.tensor)
            .collect();
        match parts.as_slice() {
            [] => Ok(None),
            [single] => Ok(Some((*single).clone())),
            _ => Ok(Some(concat(&parts, 1)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petgraph::graph::NodeIndex;

    fn node(i: usize) -> NodeId {
        NodeId(NodeIndex::new(i))
    }

    #[test]
    fn test_merge_sums_same_origin() {
        let mut q = Quantity::single(node(3), DenseTensor::ones(&[2, 1, 2]));
        q.merge(Quantity::single(node(3), DenseTensor::ones(&[2, 1, 2])))
            .unwrap();
        assert_eq!(q.factors().len(), 1);
        assert!(q.factors()[0].tensor.data().iter().all(|&x| x == 2.0));
    }

    #[test]
    fn test_merge_keeps_distinct_origins() {
        let mut q = Quantity::single(node(3), DenseTensor::ones(&[2, 1, 2]));
        let mut other = Quantity::new();
        other.push(SignedFactor {
            origin: node(3),
            sign: Sign::Minus,
            tensor: DenseTensor::ones(&[2, 2, 2]),
        });
        other.push(SignedFactor {
            origin: node(5),
            sign: Sign::Plus,
            tensor: DenseTensor::ones(&[2, 4, 2]),
        });
        q.merge(other).unwrap();
        assert_eq!(q.factors().len(), 3);

        let stacked = q.stacked_positive().unwrap().unwrap();
        assert_eq!(stacked.shape(), &[2, 5, 2]);
    }

    #[test]
    fn test_merge_rejects_mismatched_shapes() {
        let mut q = Quantity::single(node(1), DenseTensor::ones(&[2, 1, 2]));
        assert!(q.merge(Quantity::single(node(1), DenseTensor::ones(&[2, 2, 2]))).is_err());
    }

    #[test]
    fn test_try_map_keeps_tags() {
        let mut q = Quantity::new();
        q.push(SignedFactor {
            origin: node(2),
            sign: Sign::Minus,
            tensor: DenseTensor::ones(&[1, 1, 1]),
        });
        let mapped = q.try_map(|t| Ok(t.reshape(&[1, 1])?)).unwrap();
        assert_eq!(mapped.factors()[0].sign, Sign::Minus);
        assert_eq!(mapped.factors()[0].origin, node(2));
        assert_eq!(mapped.factors()[0].tensor.shape(), &[1, 1]);
        assert_eq!(Sign::Minus.value(), -1.0);
    }
}
