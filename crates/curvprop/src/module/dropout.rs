//! Inverted dropout.

use std::any::Any;
use std::cell::{Cell, RefCell};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Module, ModuleGrads, ModuleIo};
use crate::error::BackpropError;
use crate::operations::apply_binary;
use crate::tensor::DenseTensor;

/// Zeroes each element with probability `p` during training and scales the
/// survivors by `1/(1-p)`; the identity in evaluation mode.
#[derive(Debug)]
pub struct Dropout {
    p: f64,
    training: Cell<bool>,
    rng: RefCell<StdRng>,
}

impl Dropout {
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` unless `0 <= p < 1`.
    pub fn new(p: f64) -> Result<Self, BackpropError> {
        Self::with_rng(p, StdRng::from_os_rng())
    }

    /// Dropout whose masks are reproducible from `seed`.
    pub fn with_seed(p: f64, seed: u64) -> Result<Self, BackpropError> {
        Self::with_rng(p, StdRng::seed_from_u64(seed))
    }

    fn with_rng(p: f64, rng: StdRng) -> Result<Self, BackpropError> {
        if !(0.0..1.0).contains(&p) {
            return Err(BackpropError::InvalidConfiguration(format!(
                "dropout probability must lie in [0, 1), got {p}"
            )));
        }
        Ok(Self {
            p,
            training: Cell::new(true),
            rng: RefCell::new(rng),
        })
    }

    pub fn p(&self) -> f64 {
        self.p
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    pub fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    /// Survivor scale `1/(1-p)`.
    pub fn scale(&self) -> f64 {
        1.0 / (1.0 - self.p)
    }

    /// `true` when forward is the identity map.
    pub(crate) fn is_identity(&self) -> bool {
        !self.is_training() || self.p == 0.0
    }

    /// Elementwise derivative recovered from the recorded pair: the survivor
    /// scale where the output is nonzero, zero where it was dropped.
    ///
    /// Independent of the current train/eval flag. A pair with
    /// `output == input` was recorded by an identity forward.
    pub(crate) fn df(&self, input: &DenseTensor<f64>, output: &DenseTensor<f64>) -> DenseTensor<f64> {
        if self.p == 0.0 || output == input {
            return DenseTensor::ones(input.shape());
        }
        let scale = self.scale();
        crate::operations::apply(output, |y| if y != 0.0 { scale } else { 0.0 })
    }
}

impl Module for Dropout {
    fn name(&self) -> &'static str {
        "Dropout"
    }

    fn forward(&self, input: &DenseTensor<f64>) -> Result<DenseTensor<f64>, BackpropError> {
        if self.is_identity() {
            return Ok(input.clone());
        }
        let keep = 1.0 - self.p;
        let scale = self.scale();
        let mut rng = self.rng.borrow_mut();
        let mut out = input.clone();
        for v in out.data_mut() {
            *v = if rng.random::<f64>() < keep { *v * scale } else { 0.0 };
        }
        Ok(out)
    }

    fn backward(
        &self,
        io: &ModuleIo,
        grad_output: &DenseTensor<f64>,
    ) -> Result<ModuleGrads, BackpropError> {
        let df = self.df(&io.input, &io.output);
        Ok(ModuleGrads {
            input: apply_binary(&df, grad_output, |d, g| d * g)?,
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
    fn test_probability_validation() {
        assert!(Dropout::new(0.0).is_ok());
        assert!(Dropout::new(0.9).is_ok());
        assert!(Dropout::new(1.0).is_err());
        assert!(Dropout::new(-0.1).is_err());
        assert!(Dropout::new(f64::NAN).is_err());
    }

    #[test]
    fn test_zero_probability_is_identity() {
        let d = Dropout::with_seed(0.0, 1).unwrap();
        let x = DenseTensor::from_fn(&[4, 5], |i| (i[0] * 5 + i[1]) as f64 - 3.0);
        assert_eq!(d.forward(&x).unwrap(), x);
    }

    #[test]
    fn test_mask_and_scale() {
        let d = Dropout::with_seed(0.9, 7).unwrap();
        let x = DenseTensor::ones(&[50, 20]);
        let y = d.forward(&x).unwrap();
        let kept = y.data().iter().filter(|&&v| v != 0.0).count();
        assert!(kept > 40 && kept < 200);
        assert!(y.data().iter().all(|&v| v == 0.0 || (v - 10.0).abs() < 1e-12));
    }

    #[test]
    fn test_eval_mode_is_identity() {
        let d = Dropout::with_seed(0.5, 3).unwrap();
        d.set_training(false);
        let x = DenseTensor::ones(&[3, 3]);
        assert_eq!(d.forward(&x).unwrap(), x);
        assert!(d.df(&x, &x).data().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_df_follows_recorded_forward() {
        let d = Dropout::with_seed(0.5, 11).unwrap();
        let x = DenseTensor::from_fn(&[6, 6], |i| 1.0 + (i[0] * 6 + i[1]) as f64);
        let y = d.forward(&x).unwrap();
        d.set_training(false);
        let df = d.df(&x, &y);
        for (g, v) in df.data().iter().zip(y.data()) {
            assert_eq!(*g, if *v != 0.0 { 2.0 } else { 0.0 });
        }
        assert!(df.data().contains(&0.0));

        let y_eval = d.forward(&x).unwrap();
        d.set_training(true);
        assert!(d.df(&x, &y_eval).data().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_same_seed_same_mask() {
        let a = Dropout::with_seed(0.5, 42).unwrap();
        let b = Dropout::with_seed(0.5, 42).unwrap();
        let x = DenseTensor::ones(&[8, 8]);
        assert_eq!(a.forward(&x).unwrap(), b.forward(&x).unwrap());
    }
}
