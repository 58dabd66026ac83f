//! Square-root factorisations of loss Hessians.
//!
//! A factor `S: [N', V, *out]` represents the per-sample Hessian
//! `H_n = Σ_v S[n, v]ᵀ S[n, v]` w.r.t. the prediction. Exact factors have
//! `V = prod(out)`; Monte-Carlo factors have `V = mc_samples` and reproduce
//! `H_n` in expectation.

use std::fmt::Debug;

use rand::rngs::StdRng;

use crate::error::BackpropError;
use crate::module::{CrossEntropyLoss, Loss, MSELoss, downcast_loss, softmax_rows};
use crate::operations::{diag_embed, scale_inplace};
use crate::random::sample_categorical;
use crate::subsampling::subsample;
use crate::tensor::DenseTensor;

/// Loss-side start of a curvature backpropagation.
pub trait LossDerivatives: Debug {
    /// Exact symmetric factorisation of the loss Hessian.
    fn sqrt_hessian(
        &self,
        loss: &dyn Loss,
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError>;

    /// Monte-Carlo factorisation from `mc_samples` draws of the model's
    /// predictive distribution.
    fn sqrt_hessian_sampled(
        &self,
        loss: &dyn Loss,
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
        mc_samples: usize,
        rng: &mut StdRng,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError>;
}

/// `H = 2·red·I`; sampled with Gaussian noise.
#[derive(Debug, Clone, Copy, Default)]
pub struct MSELossDerivatives;

impl LossDerivatives for MSELossDerivatives {
    fn sqrt_hessian(
        &self,
        loss: &dyn Loss,
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let mse = downcast_loss::<MSELoss>(loss)?;
        // validates the target even though H does not depend on it
        mse.gradient(prediction, target)?;
        let red = mse.reduction_factor(prediction);
        let rows = subsample(prediction, subsampling)?;
        let mut factor = diag_embed(&DenseTensor::ones(rows.shape()))?;
        scale_inplace(&mut factor, (2.0 * red).sqrt());
        Ok(factor)
    }

    fn sqrt_hessian_sampled(
        &self,
        loss: &dyn Loss,
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
        mc_samples: usize,
        rng: &mut StdRng,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let mse = downcast_loss::<MSELoss>(loss)?;
        mse.gradient(prediction, target)?;
        let red = mse.reduction_factor(prediction);
        let rows = subsample(prediction, subsampling)?;
        let mut shape = vec![rows.dim(0), mc_samples];
        shape.extend_from_slice(&rows.shape()[1..]);
        let mut factor = DenseTensor::randn_with_rng(&shape, rng);
        scale_inplace(&mut factor, (2.0 * red / mc_samples.max(1) as f64).sqrt());
        Ok(factor)
    }
}

/// `H = red·(diag(p) - p pᵀ)` with `p = softmax(prediction)`; sampled from
/// labels drawn from `p`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLossDerivatives;

impl CrossEntropyLossDerivatives {
    fn probabilities(
        loss: &dyn Loss,
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<(f64, DenseTensor<f64>), BackpropError> {
        let ce = downcast_loss::<CrossEntropyLoss>(loss)?;
        ce.gradient(prediction, target)?;
        let red = ce.reduction_factor(prediction);
        Ok((red, softmax_rows(&subsample(prediction, subsampling)?)))
    }
}

impl LossDerivatives for CrossEntropyLossDerivatives {
    fn sqrt_hessian(
        &self,
        loss: &dyn Loss,
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let (red, probs) = Self::probabilities(loss, prediction, target, subsampling)?;
        let (n, c) = (probs.dim(0), probs.dim(1));
        let scale = red.sqrt();
        let p = probs.data();
        let mut data = vec![0.0; n * c * c];
        for s in 0..n {
            let ps = &p[s * c..(s + 1) * c];
            for v in 0..c {
                let sqrt_pv = ps[v].sqrt();
                let row = &mut data[(s * c + v) * c..(s * c + v + 1) * c];
                for (k, out) in row.iter_mut().enumerate() {
                    let diag = if k == v { ps[k].sqrt() } else { 0.0 };
                    *out = scale * (diag - ps[k] * sqrt_pv);
                }
            }
        }
        Ok(DenseTensor::from_parts(data, &[n, c, c]))
    }

    fn sqrt_hessian_sampled(
        &self,
        loss: &dyn Loss,
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
        mc_samples: usize,
        rng: &mut StdRng,
        subsampling: Option<&[usize]>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let (red, probs) = Self::probabilities(loss, prediction, target, subsampling)?;
        let (n, c) = (probs.dim(0), probs.dim(1));
        let scale = (red / mc_samples.max(1) as f64).sqrt();
        let mut data = Vec::with_capacity(n * mc_samples * c);
        for ps in probs.data().chunks(c.max(1)) {
            for _ in 0..mc_samples {
                let label = sample_categorical(ps, rng);
                data.extend(ps.iter().enumerate().map(|(k, &pk)| {
                    let onehot = if k == label { 1.0 } else { 0.0 };
                    scale * (pk - onehot)
                }));
            }
        }
        Ok(DenseTensor::from_parts(data, &[n, mc_samples, c]))
    }
}
