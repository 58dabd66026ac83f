//! Network layers and losses.
//!
//! A [`Module`] is a stateless forward function plus its input/parameter
//! gradient; everything curvature-related lives in the derivative routines
//! registered for its concrete type.
//!
//! ```text
//! Linear          y = x Wᵀ + b
//! Conv            1-3 spatial dims, optionally transposed
//! ReLU / Sigmoid / Tanh / Softplus
//! Dropout         inverted dropout with its own seeded generator
//! Flatten         [N, *] -> [N, prod(*)]
//! ParallelLinear  siblings reading one input, outputs concatenated
//! Sequential      chain of boxed modules
//! MSELoss / CrossEntropyLoss
//! ```

mod activation;
mod conv;
mod dropout;
mod flatten;
mod linear;
mod loss;
mod parallel;
mod sequential;

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use activation::{Pointwise, ReLU, Sigmoid, Softplus, Tanh};
pub use conv::{Conv, ConvOptions};
pub use dropout::Dropout;
pub use flatten::Flatten;
pub use linear::Linear;
pub use loss::{
    CrossEntropyLoss, Loss, MSELoss, Reduction, ReductionTolerance, infer_reduction_factor,
};
pub(crate) use loss::{downcast_loss, softmax_rows};
pub use parallel::{MeanInputBuffer, ParallelLinear};
pub use sequential::Sequential;

use crate::engine::PassId;
use crate::error::BackpropError;
use crate::tensor::DenseTensor;

static NEXT_PARAM_ID: AtomicUsize = AtomicUsize::new(0);

/// Process-unique identifier of a [`Parameter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(usize);

impl ParamId {
    fn fresh() -> Self {
        Self(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the internal index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A value written onto a parameter by an extension.
#[derive(Debug, Clone, PartialEq)]
pub enum SavedValue {
    /// Diagonal or per-sample quantity with the parameter's shape
    /// (optionally prefixed by a batch axis).
    Tensor(DenseTensor<f64>),
    /// Kronecker factors, outermost first.
    Factors(Vec<DenseTensor<f64>>),
}

/// A trainable tensor together with its gradient and extension results.
///
/// Results are written only at the end of a successful backward sweep, so
/// readers never see a partially updated savefield.
#[derive(Debug)]
pub struct Parameter {
    id: ParamId,
    value: DenseTensor<f64>,
    grad: RefCell<Option<DenseTensor<f64>>>,
    saved: RefCell<HashMap<String, SavedValue>>,
}

impl Parameter {
    /// Wrap `value` as a fresh parameter with no gradient.
    pub fn new(value: DenseTensor<f64>) -> Self {
        Self {
            id: ParamId::fresh(),
            value,
            grad: RefCell::new(None),
            saved: RefCell::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn value(&self) -> &DenseTensor<f64> {
        &self.value
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    /// Gradient from the most recent sweep that reached this parameter.
    pub fn grad(&self) -> Option<DenseTensor<f64>> {
        self.grad.borrow().clone()
    }

    /// Tensor stored under `savefield`, if the last sweep produced one.
    pub fn saved(&self, savefield: &str) -> Option<DenseTensor<f64>> {
        match self.saved.borrow().get(savefield) {
            Some(SavedValue::Tensor(t)) => Some(t.clone()),
            _ => None,
        }
    }

    /// Kronecker factors stored under `savefield`.
    pub fn saved_factors(&self, savefield: &str) -> Option<Vec<DenseTensor<f64>>> {
        match self.saved.borrow().get(savefield) {
            Some(SavedValue::Factors(f)) => Some(f.clone()),
            _ => None,
        }
    }

    /// Savefield names currently populated.
    pub fn savefields(&self) -> Vec<String> {
        let mut names: Vec<String> = self.saved.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn set_grad(&self, grad: Option<DenseTensor<f64>>) {
        *self.grad.borrow_mut() = grad;
    }

    pub(crate) fn store(&self, savefield: &str, value: SavedValue) {
        self.saved.borrow_mut().insert(savefield.to_string(), value);
    }

    pub(crate) fn clear_saved(&self, savefield: &str) {
        self.saved.borrow_mut().remove(savefield);
    }
}

/// Stored forward input/output of one module application.
#[derive(Debug, Clone)]
pub struct ModuleIo {
    pub input: DenseTensor<f64>,
    pub output: DenseTensor<f64>,
}

/// Ordinary reverse-mode result of one module application.
#[derive(Debug)]
pub struct ModuleGrads {
    pub input: DenseTensor<f64>,
    pub params: Vec<(ParamId, DenseTensor<f64>)>,
}

/// A differentiable layer.
pub trait Module: Debug + Any {
    /// Short type name used in diagnostics.
    fn name(&self) -> &'static str;

    fn forward(&self, input: &DenseTensor<f64>) -> Result<DenseTensor<f64>, BackpropError>;

    /// Vector-Jacobian product of the ordinary gradient.
    fn backward(
        &self,
        io: &ModuleIo,
        grad_output: &DenseTensor<f64>,
    ) -> Result<ModuleGrads, BackpropError>;

    /// Declared trainable parameters, with their names.
    fn parameters(&self) -> Vec<(String, &Parameter)> {
        Vec::new()
    }

    /// Runs before `forward` when the module is applied on a tape.
    fn forward_pre_hook(
        &self,
        _pass: PassId,
        _input: &DenseTensor<f64>,
    ) -> Result<(), BackpropError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// Resolve a `&dyn Module` to its concrete type.
pub(crate) fn downcast<M: Module>(module: &dyn Module) -> Result<&M, BackpropError> {
    module
        .as_any()
        .downcast_ref::<M>()
        .ok_or(BackpropError::ModuleTypeMismatch {
            expected: std::any::type_name::<M>(),
            actual: module.name(),
        })
}

/// Check a module input has rank `ndim` and, when given, `features` on axis 1.
pub(crate) fn check_input(
    context: &'static str,
    input: &DenseTensor<f64>,
    ndim: usize,
    features: Option<usize>,
) -> Result<(), BackpropError> {
    let rank_ok = input.ndim() == ndim;
    let features_ok = features.is_none_or(|f| rank_ok && input.dim(1) == f);
    if rank_ok && features_ok {
        return Ok(());
    }
    let mut expected = vec![input.shape().first().copied().unwrap_or(0)];
    expected.extend(features);
    Err(BackpropError::ShapeMismatch {
        context,
        expected,
        actual: input.shape().to_vec(),
    })
}
