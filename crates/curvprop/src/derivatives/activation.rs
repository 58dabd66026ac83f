//! Elementwise contracts for activations and dropout.

use std::fmt;
use std::marker::PhantomData;

use super::{Elementwise, ElementwiseDerivatives, sub_input};
use crate::error::BackpropError;
use crate::module::{Dropout, Module, ModuleIo, Pointwise, ReLU, Sigmoid, Softplus, Tanh, downcast};
use crate::operations::apply_binary;
use crate::subsampling::subsample;
use crate::tensor::DenseTensor;

/// `f'` and `f''` of a [`Pointwise`] activation, evaluated from the recorded
/// input and output.
pub struct ActivationDerivatives<M>(PhantomData<fn() -> M>);

impl<M> Default for ActivationDerivatives<M> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<M> fmt::Debug for ActivationDerivatives<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActivationDerivatives<{}>", std::any::type_name::<M>())
    }
}

pub type ReLUDerivatives = Elementwise<ActivationDerivatives<ReLU>>;
pub type SigmoidDerivatives = Elementwise<ActivationDerivatives<Sigmoid>>;
pub type TanhDerivatives = Elementwise<ActivationDerivatives<Tanh>>;
pub type SoftplusDerivatives = Elementwise<ActivationDerivatives<Softplus>>;

impl<M: Pointwise> ActivationDerivatives<M> {
    fn evaluate(
        module: &dyn Module,
        io: &ModuleIo,
        subsampling: Option<&[usize]>,
        f: impl Fn(&M, f64, f64) -> f64,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let m = downcast::<M>(module)?;
        let x = sub_input(io, subsampling)?;
        let y = subsample(&io.output, subsampling)?;
        Ok(apply_binary(&x, &y, |x, y| f(m, x, y))?)
    }
}

impl<M: Pointwise> ElementwiseDerivatives for ActivationDerivatives<M> {
    fn hessian_is_zero(&self) -> bool {
        M::HESSIAN_IS_ZERO
    }

    fn df(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        Self::evaluate(module, io, subsampling, M::first)
    }

    fn d2f(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        if M::HESSIAN_IS_ZERO {
            return Err(BackpropError::MissingSecondDerivative {
                module: module.name(),
            });
        }
        Self::evaluate(module, io, subsampling, M::second)
    }
}

/// Inverted-dropout Jacobian `diag(mask / (1 - p))`, read off the recorded
/// output.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropoutDerivatives;

impl ElementwiseDerivatives for DropoutDerivatives {
    fn hessian_is_zero(&self) -> bool {
        true
    }

    fn df(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let dropout = downcast::<Dropout>(module)?;
        let x = sub_input(io, subsampling)?;
        let y = subsample(&io.output, subsampling)?;
        Ok(dropout.df(&x, &y))
    }
}
