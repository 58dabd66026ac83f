//! Contract for `Flatten`: a reshape, so both Jacobian products are reshapes.

use super::{Derivatives, check_mat, with_lead};
use crate::error::BackpropError;
use crate::module::{Module, ModuleIo};
use crate::subsampling::subsampled_len;
use crate::tensor::DenseTensor;

#[derive(Debug, Clone, Copy, Default)]
pub struct FlattenDerivatives;

fn reshape_features(
    context: &'static str,
    mat: &DenseTensor<f64>,
    from: &[usize],
    to: &[usize],
    n: usize,
) -> Result<DenseTensor<f64>, BackpropError> {
    let (n, v) = check_mat(context, mat, &with_lead(&[n], from))?;
    Ok(mat.reshape(&with_lead(&[n, v], to))?)
}

impl Derivatives for FlattenDerivatives {
    fn hessian_is_zero(&self, _module: &dyn Module) -> bool {
        true
    }

    fn jac_t_mat_prod(
        &self,
        _module: &dyn Module,
        io: &ModuleIo,
        mat: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let n = subsampled_len(subsampling, io.input.dim(0));
        reshape_features(
            "Flatten jac_t_mat_prod",
            mat,
            &io.output.shape()[1..],
            &io.input.shape()[1..],
            n,
        )
    }

    fn jac_mat_prod(
        &self,
        _module: &dyn Module,
        io: &ModuleIo,
        mat: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let n = subsampled_len(subsampling, io.input.dim(0));
        reshape_features(
            "Flatten jac_mat_prod",
            mat,
            &io.input.shape()[1..],
            &io.output.shape()[1..],
            n,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Flatten;

    #[test]
    fn test_reshapes_both_ways() {
        let x = DenseTensor::<f64>::ones(&[3, 2, 2]);
        let io = ModuleIo {
            output: Flatten.forward(&x).unwrap(),
            input: x,
        };
        let mat = DenseTensor::<f64>::ones(&[2, 5, 4]);
        let back = FlattenDerivatives
            .jac_t_mat_prod(&Flatten, &io, &mat, Some(&[0, 2]))
            .unwrap();
        assert_eq!(back.shape(), &[2, 5, 2, 2]);
        let forward = FlattenDerivatives.jac_mat_prod(&Flatten, &io, &back, Some(&[0, 2])).unwrap();
        assert_eq!(forward.shape(), &[2, 5, 4]);
        assert!(FlattenDerivatives.jac_t_mat_prod(&Flatten, &io, &mat, None).is_err());
    }
}
