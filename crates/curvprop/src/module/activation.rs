//! Elementwise activation layers.

use std::any::Any;

use super::{Module, ModuleGrads, ModuleIo};
use crate::error::BackpropError;
use crate::operations::apply_binary;
use crate::tensor::DenseTensor;

/// Scalar function applied independently to every element.
///
/// Derivatives receive both the input `x` and the recorded output `y`, so
/// each activation can use whichever is cheaper or more stable.
pub trait Pointwise: Module {
    /// `f''` is identically zero, so curvature residuals can be skipped.
    const HESSIAN_IS_ZERO: bool;

    fn value(&self, x: f64) -> f64;

    fn first(&self, x: f64, y: f64) -> f64;

    fn second(&self, _x: f64, _y: f64) -> f64 {
        0.0
    }
}

fn pointwise_forward<M: Pointwise>(m: &M, input: &DenseTensor<f64>) -> DenseTensor<f64> {
    crate::operations::apply(input, |x| m.value(x))
}

fn pointwise_backward<M: Pointwise>(
    m: &M,
    io: &ModuleIo,
    grad_output: &DenseTensor<f64>,
) -> Result<ModuleGrads, BackpropError> {
    let df = apply_binary(&io.input, &io.output, |x, y| m.first(x, y))?;
    Ok(ModuleGrads {
        input: apply_binary(&df, grad_output, |d, g| d * g)?,
        params: Vec::new(),
    })
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `max(x, 0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReLU;

impl Pointwise for ReLU {
    const HESSIAN_IS_ZERO: bool = true;

    fn value(&self, x: f64) -> f64 {
        x.max(0.0)
    }

    fn first(&self, x: f64, _y: f64) -> f64 {
        if x > 0.0 { 1.0 } else { 0.0 }
    }
}

/// Logistic sigmoid.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sigmoid;

impl Pointwise for Sigmoid {
    const HESSIAN_IS_ZERO: bool = false;

    fn value(&self, x: f64) -> f64 {
        sigmoid(x)
    }

    fn first(&self, _x: f64, y: f64) -> f64 {
        y * (1.0 - y)
    }

    fn second(&self, _x: f64, y: f64) -> f64 {
        y * (1.0 - y) * (1.0 - 2.0 * y)
    }
}

/// Hyperbolic tangent.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tanh;

impl Pointwise for Tanh {
    const HESSIAN_IS_ZERO: bool = false;

    fn value(&self, x: f64) -> f64 {
        x.tanh()
    }

    fn first(&self, _x: f64, y: f64) -> f64 {
        1.0 - y * y
    }

    fn second(&self, _x: f64, y: f64) -> f64 {
        -2.0 * y * (1.0 - y * y)
    }
}

/// `log(1 + exp(beta x)) / beta`, linear once `beta x` exceeds `threshold`.
#[derive(Debug, Clone, Copy)]
pub struct Softplus {
    beta: f64,
    threshold: f64,
}

impl Default for Softplus {
    fn default() -> Self {
        Self {
            beta: 1.0,
            threshold: 20.0,
        }
    }
}

impl Softplus {
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` unless `beta` is positive and finite.
    pub fn new(beta: f64, threshold: f64) -> Result<Self, BackpropError> {
        if !(beta.is_finite() && beta > 0.0) {
            return Err(BackpropError::InvalidConfiguration(format!(
                "softplus beta must be positive, got {beta}"
            )));
        }
        Ok(Self { beta, threshold })
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn saturated(&self, x: f64) -> bool {
        self.beta * x > self.threshold
    }
}

impl Pointwise for Softplus {
    const HESSIAN_IS_ZERO: bool = false;

    fn value(&self, x: f64) -> f64 {
        if self.saturated(x) {
            x
        } else {
            let bx = self.beta * x;
            // log1p(exp(bx)) written to stay finite for large negative bx
            (bx.max(0.0) + (-bx.abs()).exp().ln_1p()) / self.beta
        }
    }

    fn first(&self, x: f64, _y: f64) -> f64 {
        if self.saturated(x) {
            1.0
        } else {
            sigmoid(self.beta * x)
        }
    }

    fn second(&self, x: f64, _y: f64) -> f64 {
        if self.saturated(x) {
            0.0
        } else {
            let s = sigmoid(self.beta * x);
            self.beta * s * (1.0 - s)
        }
    }
}

macro_rules! pointwise_module {
    ($($ty:ident),*) => {$(
        impl Module for $ty {
            fn name(&self) -> &'static str {
                stringify!($ty)
            }

            fn forward(&self, input: &DenseTensor<f64>) -> Result<DenseTensor<f64>, BackpropError> {
                Ok(pointwise_forward(self, input))
            }

            fn backward(
                &self,
                io: &ModuleIo,
                grad_output: &DenseTensor<f64>,
            ) -> Result<ModuleGrads, BackpropError> {
                pointwise_backward(self, io, grad_output)
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    )*};
}

pointwise_module!(ReLU, Sigmoid, Tanh, Softplus);

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn numeric_first<M: Pointwise>(m: &M, x: f64) -> f64 {
        let h = 1e-6;
        (m.value(x + h) - m.value(x - h)) / (2.0 * h)
    }

    fn numeric_second<M: Pointwise>(m: &M, x: f64) -> f64 {
        let h = 1e-4;
        (m.value(x + h) - 2.0 * m.value(x) + m.value(x - h)) / (h * h)
    }

    fn check<M: Pointwise>(m: &M) {
        for &x in &[-2.5, -0.3, 0.4, 1.7] {
            let y = m.value(x);
            assert_relative_eq!(m.first(x, y), numeric_first(m, x), epsilon = 1e-6);
            assert_relative_eq!(m.second(x, y), numeric_second(m, x), epsilon = 1e-4);
        }
    }

    #[test]
    fn test_derivatives_match_finite_differences() {
        check(&ReLU);
        check(&Sigmoid);
        check(&Tanh);
        check(&Softplus::default());
        check(&Softplus::new(2.0, 20.0).unwrap());
    }

    #[test]
    fn test_softplus_threshold_branch() {
        let sp = Softplus::new(1.0, 5.0).unwrap();
        assert_eq!(sp.value(6.0), 6.0);
        assert_eq!(sp.first(6.0, 6.0), 1.0);
        assert_eq!(sp.second(6.0, 6.0), 0.0);
        assert!(sp.first(4.0, sp.value(4.0)) < 1.0);
        assert!(sp.value(-800.0).is_finite());
        assert!(Softplus::new(0.0, 20.0).is_err());
    }

    #[test]
    fn test_backward_is_df_times_grad() {
        let x = DenseTensor::from_vec(vec![-1.0, 2.0], &[1, 2]).unwrap();
        let io = ModuleIo {
            output: ReLU.forward(&x).unwrap(),
            input: x,
        };
        let g = DenseTensor::from_vec(vec![3.0, 4.0], &[1, 2]).unwrap();
        let grads = ReLU.backward(&io, &g).unwrap();
        assert_eq!(grads.input.data(), &[0.0, 4.0]);
        assert!(grads.params.is_empty());
    }
}
