//! Ordered chain of layers.

use super::{Module, downcast};
use crate::engine::{Tape, Var};
use crate::error::BackpropError;
use crate::tensor::DenseTensor;

/// Layers applied one after another.
///
/// Each child becomes its own node when the chain is recorded on a
/// [`Tape`], so extensions see the individual layers rather than the
/// container.
#[derive(Debug, Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer.
    pub fn push<M: Module>(&mut self, layer: M) {
        self.layers.push(Box::new(layer));
    }

    /// Builder form of [`Sequential::push`].
    pub fn with<M: Module>(mut self, layer: M) -> Self {
        self.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> impl Iterator<Item = &dyn Module> {
        self.layers.iter().map(|l| l.as_ref())
    }

    /// Layer `index` as its concrete type.
    pub fn layer<M: Module>(&self, index: usize) -> Option<&M> {
        self.layers
            .get(index)
            .and_then(|l| downcast::<M>(l.as_ref()).ok())
    }

    /// Record every layer on `tape`, returning the final output.
    pub fn forward<'m>(&'m self, tape: &mut Tape<'m>, input: &Var) -> Result<Var, BackpropError> {
        let mut x = input.clone();
        for layer in &self.layers {
            x = tape.apply(layer.as_ref(), &x)?;
        }
        Ok(x)
    }

    /// Plain forward evaluation without recording.
    pub fn predict(&self, input: &DenseTensor<f64>) -> Result<DenseTensor<f64>, BackpropError> {
        let mut x = input.clone();
        for layer in &self.layers {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }
}
