//! Fully connected layer.

use std::any::Any;
use std::rc::Rc;

use rand::Rng;

use super::parallel::MeanInputBuffer;
use super::{Module, ModuleGrads, ModuleIo, Parameter, check_input};
use crate::engine::PassId;
use crate::error::BackpropError;
use crate::operations::{matmul, sum_axis};
use crate::random::uniform_symmetric;
use crate::tensor::DenseTensor;

/// `y = x Wᵀ + b` with `W: [out, in]`, `b: [out]`, `x: [N, in]`.
#[derive(Debug)]
pub struct Linear {
    in_features: usize,
    out_features: usize,
    weight: Parameter,
    bias: Option<Parameter>,
    mean_input: Option<Rc<MeanInputBuffer>>,
}

impl Linear {
    /// Randomly initialised layer, `U(-1/√in, 1/√in)` for weight and bias.
    pub fn new(in_features: usize, out_features: usize, bias: bool) -> Self {
        Self::with_rng(in_features, out_features, bias, &mut rand::rng())
    }

    /// As [`Linear::new`] with a caller-supplied generator.
    pub fn with_rng<R: Rng>(in_features: usize, out_features: usize, bias: bool, rng: &mut R) -> Self {
        let bound = 1.0 / (in_features.max(1) as f64).sqrt();
        let weight = uniform_symmetric(&[out_features, in_features], bound, rng);
        let bias = bias.then(|| uniform_symmetric(&[out_features], bound, rng));
        Self::assemble(weight, bias)
    }

    /// Layer with the given weight `[out, in]` and optional bias `[out]`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the weight is not 2-D or the bias length
    /// differs from the weight's row count.
    pub fn from_tensors(
        weight: DenseTensor<f64>,
        bias: Option<DenseTensor<f64>>,
    ) -> Result<Self, BackpropError> {
        if weight.ndim() != 2 {
            return Err(BackpropError::ShapeMismatch {
                context: "Linear weight",
                expected: vec![0, 0],
                actual: weight.shape().to_vec(),
            });
        }
        if let Some(b) = &bias
            && b.shape() != [weight.dim(0)]
        {
            return Err(BackpropError::ShapeMismatch {
                context: "Linear bias",
                expected: vec![weight.dim(0)],
                actual: b.shape().to_vec(),
            });
        }
        Ok(Self::assemble(weight, bias))
    }

    fn assemble(weight: DenseTensor<f64>, bias: Option<DenseTensor<f64>>) -> Self {
        Self {
            in_features: weight.dim(1),
            out_features: weight.dim(0),
            weight: Parameter::new(weight),
            bias: bias.map(Parameter::new),
            mean_input: None,
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    /// Shared mean-input statistic, when this layer belongs to a parallel group.
    pub fn mean_input(&self) -> Option<&Rc<MeanInputBuffer>> {
        self.mean_input.as_ref()
    }

    pub(crate) fn bind_mean_input(&mut self, buffer: Rc<MeanInputBuffer>) {
        self.mean_input = Some(buffer);
    }
}

/// Add `bias` to every row of a `[N, out]` tensor.
pub(crate) fn add_bias_rows(y: &mut DenseTensor<f64>, bias: &DenseTensor<f64>) {
    let out = bias.len();
    if out == 0 {
        return;
    }
    for row in y.data_mut().chunks_mut(out) {
        for (v, &b) in row.iter_mut().zip(bias.data()) {
            *v += b;
        }
    }
}

impl Module for Linear {
    fn name(&self) -> &'static str {
        "Linear"
    }

    fn forward(&self, input: &DenseTensor<f64>) -> Result<DenseTensor<f64>, BackpropError> {
        check_input("Linear input", input, 2, Some(self.in_features))?;
        let mut y = matmul(input, self.weight.value(), false, true)?;
        if let Some(b) = &self.bias {
            add_bias_rows(&mut y, b.value());
        }
        Ok(y)
    }

    fn backward(
        &self,
        io: &ModuleIo,
        grad_output: &DenseTensor<f64>,
    ) -> Result<ModuleGrads, BackpropError> {
        let input = matmul(grad_output, self.weight.value(), false, false)?;
        let mut params = vec![(
            self.weight.id(),
            matmul(grad_output, &io.input, true, false)?,
        )];
        if let Some(b) = &self.bias {
            params.push((b.id(), sum_axis(grad_output, 0)?));
        }
        Ok(ModuleGrads { input, params })
    }

    fn parameters(&self) -> Vec<(String, &Parameter)> {
        let mut params = vec![("weight".to_string(), &self.weight)];
        if let Some(b) = &self.bias {
            params.push(("bias".to_string(), b));
        }
        params
    }

    fn forward_pre_hook(&self, pass: PassId, input: &DenseTensor<f64>) -> Result<(), BackpropError> {
        if let Some(buffer) = &self.mean_input {
            buffer.record(pass, input)?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
