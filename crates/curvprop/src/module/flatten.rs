//! Collapse all non-batch axes.

use std::any::Any;

use super::{Module, ModuleGrads, ModuleIo};
use crate::error::BackpropError;
use crate::tensor::DenseTensor;

/// `[N, *] -> [N, prod(*)]`, a zero-copy reshape.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flatten;

impl Module for Flatten {
    fn name(&self) -> &'static str {
        "Flatten"
    }

    fn forward(&self, input: &DenseTensor<f64>) -> Result<DenseTensor<f64>, BackpropError> {
        if input.ndim() == 0 {
            return Err(BackpropError::ShapeMismatch {
                context: "Flatten input",
                expected: vec![0],
                actual: Vec::new(),
            });
        }
        let features: usize = input.shape()[1..].iter().product();
        Ok(input.reshape(&[input.dim(0), features])?)
    }

    fn backward(
        &self,
        io: &ModuleIo,
        grad_output: &DenseTensor<f64>,
    ) -> Result<ModuleGrads, BackpropError> {
        Ok(ModuleGrads {
            input: grad_output.reshape(io.input.shape())?,
            params: Vec::new(),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_roundtrip() {
        let x = DenseTensor::<f64>::ones(&[2, 3, 4]);
        let y = Flatten.forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 12]);
        assert!(y.shares_storage_with(&x));
        let io = ModuleIo { input: x, output: y };
        let g = DenseTensor::ones(&[2, 12]);
        assert_eq!(Flatten.backward(&io, &g).unwrap().input.shape(), &[2, 3, 4]);
        assert!(Flatten.forward(&DenseTensor::scalar(1.0)).is_err());
    }
}
