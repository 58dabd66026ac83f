//! Loss functions terminating a tape.

use std::any::Any;
use std::fmt::Debug;

use crate::error::{BackpropError, TensorError};
use crate::tensor::DenseTensor;

/// How per-element losses are combined into the scalar loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reduction {
    #[default]
    Mean,
    Sum,
}

/// A scalar objective of a prediction and a target.
pub trait Loss: Debug + Any {
    fn name(&self) -> &'static str;

    fn reduction(&self) -> Reduction;

    /// Reduced loss value.
    fn forward(
        &self,
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
    ) -> Result<f64, BackpropError>;

    /// Loss of every sample on its own, each with this loss's reduction
    /// applied to a batch of one. Shape `[N]`.
    fn unreduced(
        &self,
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
    ) -> Result<DenseTensor<f64>, BackpropError>;

    /// Gradient of the reduced loss w.r.t. `prediction`.
    fn gradient(
        &self,
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
    ) -> Result<DenseTensor<f64>, BackpropError>;

    /// Factor multiplying the summed per-element terms: `1` for
    /// [`Reduction::Sum`], one over the number of averaged terms for
    /// [`Reduction::Mean`].
    fn reduction_factor(&self, prediction: &DenseTensor<f64>) -> f64;

    fn as_any(&self) -> &dyn Any;
}

/// Resolve a `&dyn Loss` to its concrete type.
pub(crate) fn downcast_loss<L: Loss>(loss: &dyn Loss) -> Result<&L, BackpropError> {
    loss.as_any()
        .downcast_ref::<L>()
        .ok_or(BackpropError::ModuleTypeMismatch {
            expected: std::any::type_name::<L>(),
            actual: loss.name(),
        })
}

/// Mean squared error, `red · Σ (ŷ - y)²`.
///
/// With [`Reduction::Mean`] the average runs over every element, so
/// `red = 1 / (N · D)` for a prediction `[N, *]` with `D` features per sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct MSELoss {
    reduction: Reduction,
}

impl MSELoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    fn check(prediction: &DenseTensor<f64>, target: &DenseTensor<f64>) -> Result<(), BackpropError> {
        if prediction.ndim() < 2 || prediction.shape() != target.shape() {
            return Err(BackpropError::ShapeMismatch {
                context: "MSELoss target",
                expected: prediction.shape().to_vec(),
                actual: target.shape().to_vec(),
            });
        }
        Ok(())
    }
}

impl Loss for MSELoss {
    fn name(&self) -> &'static str {
        "MSELoss"
    }

    fn reduction(&self) -> Reduction {
        self.reduction
    }

    fn forward(
        &self,
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
    ) -> Result<f64, BackpropError> {
        Self::check(prediction, target)?;
        let total: f64 = prediction
            .data()
            .iter()
            .zip(target.data())
            .map(|(p, t)| (p - t).powi(2))
            .sum();
        Ok(self.reduction_factor(prediction) * total)
    }

    fn unreduced(
        &self,
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        Self::check(prediction, target)?;
        let n = prediction.dim(0);
        let features = prediction.len() / n.max(1);
        let scale = match self.reduction {
            Reduction::Mean => 1.0 / features.max(1) as f64,
            Reduction::Sum => 1.0,
        };
        let data = prediction
            .data()
            .chunks(features.max(1))
            .zip(target.data().chunks(features.max(1)))
            .map(|(p, t)| scale * p.iter().zip(t).map(|(a, b)| (a - b).powi(2)).sum::<f64>())
            .collect();
        Ok(DenseTensor::from_parts(data, &[n]))
    }

    fn gradient(
        &self,
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        Self::check(prediction, target)?;
        let factor = 2.0 * self.reduction_factor(prediction);
        Ok(crate::operations::apply_binary(prediction, target, |p, t| {
            factor * (p - t)
        })?)
    }

    fn reduction_factor(&self, prediction: &DenseTensor<f64>) -> f64 {
        match self.reduction {
            Reduction::Mean => 1.0 / prediction.len().max(1) as f64,
            Reduction::Sum => 1.0,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Softmax cross-entropy on logits `[N, C]` with class-index targets `[N]`.
///
/// Targets are stored as `f64` and must hold integral values in `0..C`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss {
    reduction: Reduction,
}

impl CrossEntropyLoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    /// Validated class index per sample.
    fn classes(
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
    ) -> Result<Vec<usize>, BackpropError> {
        if prediction.ndim() != 2 || target.shape() != [prediction.dim(0)] {
            return Err(BackpropError::ShapeMismatch {
                context: "CrossEntropyLoss target",
                expected: vec![prediction.shape().first().copied().unwrap_or(0)],
                actual: target.shape().to_vec(),
            });
        }
        let c = prediction.dim(1);
        target
            .data()
            .iter()
            .map(|&t| -> Result<usize, BackpropError> {
                let class = t as usize;
                if t < 0.0 || t.fract() != 0.0 || class >= c {
                    Err(TensorError::IndexOutOfBounds {
                        index: class,
                        dim_size: c,
                    }
                    .into())
                } else {
                    Ok(class)
                }
            })
            .collect()
    }

    fn per_sample(
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
    ) -> Result<Vec<f64>, BackpropError> {
        let classes = Self::classes(prediction, target)?;
        let c = prediction.dim(1);
        Ok(prediction
            .data()
            .chunks(c.max(1))
            .zip(classes)
            .map(|(z, class)| log_sum_exp(z) - z[class])
            .collect())
    }
}

fn log_sum_exp(z: &[f64]) -> f64 {
    let max = z.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    max + z.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Row-wise softmax of `[N, C]` logits.
pub(crate) fn softmax_rows(logits: &DenseTensor<f64>) -> DenseTensor<f64> {
    let c = logits.shape().last().copied().unwrap_or(1).max(1);
    let mut out = logits.clone();
    for row in out.data_mut().chunks_mut(c) {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut total = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            total += *v;
        }
        for v in row.iter_mut() {
            *v /= total;
        }
    }
    out
}

impl Loss for CrossEntropyLoss {
    fn name(&self) -> &'static str {
        "CrossEntropyLoss"
    }

    fn reduction(&self) -> Reduction {
        self.reduction
    }

    fn forward(
        &self,
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
    ) -> Result<f64, BackpropError> {
        let losses = Self::per_sample(prediction, target)?;
        Ok(self.reduction_factor(prediction) * losses.iter().sum::<f64>())
    }

    fn unreduced(
        &self,
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let losses = Self::per_sample(prediction, target)?;
        let n = losses.len();
        Ok(DenseTensor::from_parts(losses, &[n]))
    }

    fn gradient(
        &self,
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let classes = Self::classes(prediction, target)?;
        let red = self.reduction_factor(prediction);
        let c = prediction.dim(1);
        let mut grad = softmax_rows(prediction);
        for (row, class) in grad.data_mut().chunks_mut(c.max(1)).zip(classes) {
            row[class] -= 1.0;
            for v in row.iter_mut() {
                *v *= red;
            }
        }
        Ok(grad)
    }

    fn reduction_factor(&self, prediction: &DenseTensor<f64>) -> f64 {
        match self.reduction {
            Reduction::Mean => 1.0 / prediction.shape().first().copied().unwrap_or(1).max(1) as f64,
            Reduction::Sum => 1.0,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Tolerances deciding when two reduced loss values are "the same".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReductionTolerance {
    pub rtol: f64,
    pub atol: f64,
}

impl Default for ReductionTolerance {
    fn default() -> Self {
        Self {
            rtol: 1e-5,
            atol: 1e-8,
        }
    }
}

impl ReductionTolerance {
    pub fn is_close(&self, a: f64, b: f64) -> bool {
        (a - b).abs() <= self.atol + self.rtol * b.abs()
    }
}

/// Recover the batch reduction factor of `loss` from its per-sample values.
///
/// Returns `1 / N` if `loss` is the mean of `unreduced` and `1` if it is the
/// sum.
///
/// # Errors
///
/// `ReductionAmbiguity` when mean and sum coincide (e.g. a batch of one), and
/// `ReductionMismatch` when `loss` matches neither.
pub fn infer_reduction_factor(
    loss: f64,
    unreduced: &DenseTensor<f64>,
    tolerance: ReductionTolerance,
) -> Result<f64, BackpropError> {
    let n = unreduced.len();
    let sum: f64 = unreduced.data().iter().sum();
    let mean = sum / n.max(1) as f64;
    if tolerance.is_close(mean, sum) {
        return Err(BackpropError::ReductionAmbiguity { mean, sum });
    }
    if tolerance.is_close(loss, mean) {
        Ok(1.0 / n as f64)
    } else if tolerance.is_close(loss, sum) {
        Ok(1.0)
    } else {
        Err(BackpropError::ReductionMismatch { loss, mean, sum })
    }
}
