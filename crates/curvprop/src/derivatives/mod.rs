//! Derivative contracts of every supported layer.
//!
//! A contract is a stateless strategy object that knows how to multiply a
//! batch of matrices by a layer's Jacobians without forming them. Matrices
//! are laid out as `[N, V, *features]`: `N` samples (after subsampling), `V`
//! directions per sample, then the feature shape of the layer's input or
//! output.
//!
//! ```text
//! Module            contract
//! ------            --------
//! Linear            LinearDerivatives
//! ParallelLinear    ParallelLinearDerivatives
//! Conv              ConvDerivatives
//! ReLU/Sigmoid/..   Elementwise<ActivationDerivatives<M>>
//! Dropout           Elementwise<DropoutDerivatives>
//! Flatten           FlattenDerivatives
//! MSELoss           MSELossDerivatives
//! CrossEntropyLoss  CrossEntropyLossDerivatives
//! ```

mod activation;
mod conv;
mod flatten;
mod linear;
mod loss;

use std::fmt::Debug;

pub use activation::{
    ActivationDerivatives, DropoutDerivatives, ReLUDerivatives, SigmoidDerivatives,
    SoftplusDerivatives, TanhDerivatives,
};
pub use conv::ConvDerivatives;
pub use flatten::FlattenDerivatives;
pub use linear::{LinearDerivatives, ParallelLinearDerivatives};
pub(crate) use linear::{sibling_block, sibling_param};
pub use loss::{CrossEntropyLossDerivatives, LossDerivatives, MSELossDerivatives};

use crate::error::BackpropError;
use crate::module::{Module, ModuleIo};
use crate::subsampling::subsample;
use crate::tensor::DenseTensor;

/// Jacobian products of one layer type.
///
/// Every method receives the module as `&dyn Module` together with the
/// input/output recorded on the tape; implementations downcast to their
/// concrete layer.
pub trait Derivatives: Debug {
    /// The layer's output is affine in its input.
    fn hessian_is_zero(&self, module: &dyn Module) -> bool;

    /// `Jᵀ M` for `M: [N', V, *out]`, giving `[N', V, *in]`.
    fn jac_t_mat_prod(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        mat: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError>;

    /// `J M` for `M: [N', V, *in]`, giving `[N', V, *out]`.
    fn jac_mat_prod(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        mat: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError>;

    /// `J_θᵀ M` for the parameter named `param` and `M: [N', V, *out]`.
    ///
    /// Gives `[V, *param]` when `sum_batch` is set, else `[N', V, *param]`.
    fn param_jac_t_mat_prod(
        &self,
        module: &dyn Module,
        _io: &ModuleIo,
        param: &str,
        _mat: &DenseTensor<f64>,
        _sum_batch: bool,
        _subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        Err(BackpropError::UnknownParameter {
            module: module.name(),
            param: param.to_string(),
        })
    }

    /// `J_θ M` for `M: [V, *param]`, giving `[N', V, *out]`.
    fn param_jac_mat_prod(
        &self,
        module: &dyn Module,
        _io: &ModuleIo,
        param: &str,
        _mat: &DenseTensor<f64>,
        _subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        Err(BackpropError::UnknownParameter {
            module: module.name(),
            param: param.to_string(),
        })
    }

    /// Elementwise second derivative at the recorded input, `[N', *in]`.
    ///
    /// Only elementwise layers whose Hessian is not zero provide one.
    fn d2f(
        &self,
        module: &dyn Module,
        _io: &ModuleIo,
        _subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        Err(BackpropError::MissingSecondDerivative {
            module: module.name(),
        })
    }
}

/// Layers acting on every element independently, `y_i = f(x_i)`.
pub trait ElementwiseDerivatives: Debug {
    fn hessian_is_zero(&self) -> bool;

    /// `f'` at the recorded activations, `[N', *in]`.
    fn df(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError>;

    /// `f''` at the recorded activations, `[N', *in]`.
    fn d2f(
        &self,
        module: &dyn Module,
        _io: &ModuleIo,
        _subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        Err(BackpropError::MissingSecondDerivative {
            module: module.name(),
        })
    }
}

/// Adapts an [`ElementwiseDerivatives`] to [`Derivatives`]; the Jacobian is
/// `diag(f')`, so both products scale `M` by `f'` broadcast over `V`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Elementwise<D>(pub D);

impl<D: ElementwiseDerivatives> Elementwise<D> {
    fn diag_prod(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        mat: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let df = self.0.df(module, io, subsampling)?;
        let (n, v) = check_mat("elementwise Jacobian product", mat, df.shape())?;
        let features = df.len() / n.max(1);
        let mut out = mat.clone();
        let data = out.data_mut();
        for s in 0..n {
            let d = &df.data()[s * features..(s + 1) * features];
            for r in 0..v {
                let row = &mut data[(s * v + r) * features..(s * v + r + 1) * features];
                for (m, &f) in row.iter_mut().zip(d) {
                    *m *= f;
                }
            }
        }
        Ok(out)
    }
}

impl<D: ElementwiseDerivatives> Derivatives for Elementwise<D> {
    fn hessian_is_zero(&self, _module: &dyn Module) -> bool {
        self.0.hessian_is_zero()
    }

    fn jac_t_mat_prod(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        mat: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        self.diag_prod(module, io, mat, subsampling)
    }

    fn jac_mat_prod(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        mat: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        self.diag_prod(module, io, mat, subsampling)
    }

    fn d2f(
        &self,
        module: &dyn Module,
        io: &ModuleIo,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        self.0.d2f(module, io, subsampling)
    }
}

/// Check `mat` is `[N', V, *features]` for `batch = [N', *features]`; returns
/// `(N', V)`.
pub(crate) fn check_mat(
    context: &'static str,
    mat: &DenseTensor<f64>,
    batch: &[usize],
) -> Result<(usize, usize), BackpropError> {
    let ok = !batch.is_empty()
        && mat.ndim() == batch.len() + 1
        && mat.dim(0) == batch[0]
        && mat.shape()[2..] == batch[1..];
    if !ok {
        let mut expected = vec![batch.first().copied().unwrap_or(0), 0];
        expected.extend(batch.iter().skip(1));
        return Err(BackpropError::ShapeMismatch {
            context,
            expected,
            actual: mat.shape().to_vec(),
        });
    }
    Ok((mat.dim(0), mat.dim(1)))
}

/// Recorded input restricted to the subsampled rows.
pub(crate) fn sub_input(
    io: &ModuleIo,
    subsampling: Option<&[usize]>,
) -> Result<DenseTensor<f64>, BackpropError> {
    subsample(&io.input, subsampling)
}

/// `[*lead, *shape]`.
pub(crate) fn with_lead(lead: &[usize], shape: &[usize]) -> Vec<usize> {
    let mut out = lead.to_vec();
    out.extend_from_slice(shape);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Linear, ReLU};

    #[test]
    fn test_check_mat() {
        let mat = DenseTensor::<f64>::zeros(&[4, 3, 5]);
        assert_eq!(check_mat("t", &mat, &[4, 5]).unwrap(), (4, 3));
        assert!(check_mat("t", &mat, &[3, 5]).is_err());
        assert!(check_mat("t", &mat, &[4, 2]).is_err());
        assert!(check_mat("t", &mat, &[]).is_err());
    }

    #[test]
    fn test_elementwise_scales_every_direction() {
        let x = DenseTensor::from_vec(vec![-1.0, 2.0, 3.0, -4.0], &[2, 2]).unwrap();
        let io = ModuleIo {
            output: ReLU.forward(&x).unwrap(),
            input: x,
        };
        let mat = DenseTensor::from_fn(&[2, 3, 2], |i| (1 + i[1]) as f64);
        let d = ReLUDerivatives::default();
        let out = d.jac_t_mat_prod(&ReLU, &io, &mat, None).unwrap();
        assert_eq!(
            out.data(),
            &[0.0, 1.0, 0.0, 2.0, 0.0, 3.0, 1.0, 0.0, 2.0, 0.0, 3.0, 0.0]
        );
        let sub = DenseTensor::from_fn(&[1, 1, 2], |_| 1.0);
        let out = d.jac_mat_prod(&ReLU, &io, &sub, Some(&[1])).unwrap();
        assert_eq!(out.data(), &[1.0, 0.0]);
    }

    #[test]
    fn test_default_param_products_reject_unknown() {
        let x = DenseTensor::<f64>::ones(&[1, 2]);
        let io = ModuleIo {
            output: x.clone(),
            input: x,
        };
        let mat = DenseTensor::<f64>::ones(&[1, 1, 2]);
        let d = ReLUDerivatives::default();
        assert!(matches!(
            d.param_jac_t_mat_prod(&ReLU, &io, "weight", &mat, true, None),
            Err(BackpropError::UnknownParameter { .. })
        ));
        assert!(matches!(
            d.d2f(&ReLU, &io, None),
            Err(BackpropError::MissingSecondDerivative { module: "ReLU" })
        ));
        let lin = Linear::new(2, 2, false);
        assert!(
            LinearDerivatives
                .param_jac_t_mat_prod(&lin, &io, "bias", &mat, true, None)
                .is_err()
        );
    }
}
