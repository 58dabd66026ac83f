//! Extensions: what to compute during the backward sweep.
//!
//! An [`Extension`] bundles the quantity to extract, its loss-Hessian
//! strategy, subsampling and fail mode, and a registry mapping layer types to
//! their derivative contracts. The registry is resolved once at
//! construction; the sweep only looks handlers up.
//!
//! ```text
//! constructor                 savefield              strategies
//! diag_ggn_exact()            diag_ggn_exact         EXACT
//! diag_ggn_mc(m)              diag_ggn_mc            SAMPLING
//! batch_diag_ggn_exact()      diag_ggn_exact_batch   EXACT
//! batch_diag_ggn_mc(m)        diag_ggn_mc_batch      SAMPLING
//! diag_hessian()              diag_h                 EXACT
//! batch_diag_hessian()        diag_h_batch           EXACT
//! batch_grad()                grad_batch             -
//! kflr() / kfac(m)            kflr / kfac            EXACT / SAMPLING
//! ```

pub(crate) mod dispatcher;
pub(crate) mod extractor;
pub(crate) mod quantity;
pub(crate) mod registry;

use std::cell::{RefCell, RefMut};

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::derivatives::{Derivatives, LossDerivatives};
use crate::error::BackpropError;
use crate::module::{Loss, Module};
use extractor::GenericExtractor;
use registry::Registry;

/// How the loss Hessian is factorised at the start of the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LossHessianStrategy {
    /// Symmetric factorisation of the true Hessian.
    Exact,
    /// Monte-Carlo draws from the model's predictive distribution.
    Sampling,
}

/// What to do when the sweep reaches a layer without a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailMode {
    /// Abort the sweep.
    #[default]
    Error,
    /// Log a warning and skip the layer and everything before it.
    Warn,
    /// Skip without logging.
    Silent,
}

/// Input-side Kronecker factor of fully connected layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFactor {
    /// `Xᵀ X / N`.
    #[default]
    SecondMoment,
    /// `x̄ x̄ᵀ`, from the shared mean-input buffer when one is available.
    MeanInput,
}

/// The quantity an extension computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionKind {
    DiagGgn,
    BatchDiagGgn,
    DiagHessian,
    BatchDiagHessian,
    BatchGrad,
    Kronecker,
}

impl ExtensionKind {
    /// Loss-Hessian strategies the kind accepts.
    pub fn valid_strategies(self) -> &'static [LossHessianStrategy] {
        match self {
            ExtensionKind::DiagGgn | ExtensionKind::BatchDiagGgn | ExtensionKind::Kronecker => {
                &[LossHessianStrategy::Exact, LossHessianStrategy::Sampling]
            }
            ExtensionKind::DiagHessian | ExtensionKind::BatchDiagHessian => &[LossHessianStrategy::Exact],
            ExtensionKind::BatchGrad => &[],
        }
    }

    /// Whether results are summed over the batch (else kept per sample).
    pub fn sums_batch(self) -> bool {
        matches!(
            self,
            ExtensionKind::DiagGgn | ExtensionKind::DiagHessian | ExtensionKind::Kronecker
        )
    }

    /// Whether the kind backpropagates a curvature factor.
    pub fn propagates_curvature(self) -> bool {
        self != ExtensionKind::BatchGrad
    }
}

/// A configured extension, passed to [`backward`](crate::engine::backward).
///
/// # Example
///
/// ```
/// use curvprop::{Extension, FailMode};
///
/// let ext = Extension::diag_ggn_mc(4)
///     .unwrap()
///     .with_subsampling(&[0, 2])
///     .with_fail_mode(FailMode::Warn)
///     .with_seed(7);
/// assert_eq!(ext.savefield(), "diag_ggn_mc");
/// assert_eq!(ext.mc_samples(), 4);
/// ```
#[derive(Debug)]
pub struct Extension {
    kind: ExtensionKind,
    strategy: LossHessianStrategy,
    mc_samples: usize,
    subsampling: Option<Vec<usize>>,
    fail_mode: FailMode,
    input_factor: InputFactor,
    rng: RefCell<StdRng>,
    registry: Registry,
}

impl Extension {
    fn build(kind: ExtensionKind, strategy: LossHessianStrategy, mc_samples: usize) -> Self {
        Self {
            kind,
            strategy,
            mc_samples,
            subsampling: None,
            fail_mode: FailMode::default(),
            input_factor: InputFactor::default(),
            rng: RefCell::new(StdRng::from_os_rng()),
            registry: Registry::default(),
        }
    }

    fn sampled(kind: ExtensionKind, mc_samples: usize) -> Result<Self, BackpropError> {
        check_mc_samples(mc_samples)?;
        Ok(Self::build(kind, LossHessianStrategy::Sampling, mc_samples))
    }

    /// Extension of `kind` with an explicit strategy.
    ///
    /// # Errors
    ///
    /// `InvalidLossHessianStrategy` if `kind` does not accept `strategy`,
    /// `InvalidConfiguration` for `mc_samples == 0` under `Sampling`.
    /// `BatchGrad` takes no loss Hessian, so only `Exact` is accepted for it
    /// and `mc_samples` is unused.
    pub fn new(
        kind: ExtensionKind,
        strategy: LossHessianStrategy,
        mc_samples: usize,
    ) -> Result<Self, BackpropError> {
        let ext = Self::build(kind, LossHessianStrategy::Exact, 1);
        if kind == ExtensionKind::BatchGrad {
            if strategy == LossHessianStrategy::Sampling {
                return Err(BackpropError::InvalidLossHessianStrategy {
                    strategy,
                    extension: format!("{kind:?}"),
                    valid: Vec::new(),
                });
            }
            if mc_samples != 1 {
                warn!(mc_samples, "BatchGrad ignores mc_samples");
            }
            return Ok(ext);
        }
        let ext = ext.with_loss_hessian_strategy(strategy)?;
        match strategy {
            LossHessianStrategy::Exact => Ok(ext),
            LossHessianStrategy::Sampling => ext.with_mc_samples(mc_samples),
        }
    }

    /// Diagonal of the GGN, summed over the batch.
    pub fn diag_ggn_exact() -> Self {
        Self::build(ExtensionKind::DiagGgn, LossHessianStrategy::Exact, 1)
    }

    /// Monte-Carlo diagonal GGN (diagonal Fisher) from `mc_samples` draws.
    pub fn diag_ggn_mc(mc_samples: usize) -> Result<Self, BackpropError> {
        Self::sampled(ExtensionKind::DiagGgn, mc_samples)
    }

    pub fn batch_diag_ggn_exact() -> Self {
        Self::build(ExtensionKind::BatchDiagGgn, LossHessianStrategy::Exact, 1)
    }

    pub fn batch_diag_ggn_mc(mc_samples: usize) -> Result<Self, BackpropError> {
        Self::sampled(ExtensionKind::BatchDiagGgn, mc_samples)
    }

    /// Diagonal of the full Hessian, including second derivatives of
    /// nonlinear layers.
    pub fn diag_hessian() -> Self {
        Self::build(ExtensionKind::DiagHessian, LossHessianStrategy::Exact, 1)
    }

    pub fn batch_diag_hessian() -> Self {
        Self::build(ExtensionKind::BatchDiagHessian, LossHessianStrategy::Exact, 1)
    }

    /// Per-sample gradients.
    pub fn batch_grad() -> Self {
        Self::build(ExtensionKind::BatchGrad, LossHessianStrategy::Exact, 1)
    }

    /// Kronecker factors from the exact loss Hessian.
    pub fn kflr() -> Self {
        Self::build(ExtensionKind::Kronecker, LossHessianStrategy::Exact, 1)
    }

    /// Kronecker factors from a Monte-Carlo loss Hessian.
    pub fn kfac(mc_samples: usize) -> Result<Self, BackpropError> {
        Self::sampled(ExtensionKind::Kronecker, mc_samples)
    }

    /// Restrict the extension to the given batch rows, in order.
    ///
    /// Indices are checked against the batch size when the sweep starts.
    pub fn with_subsampling(mut self, indices: &[usize]) -> Self {
        self.subsampling = Some(indices.to_vec());
        self
    }

    pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = fail_mode;
        self
    }

    /// Seed the Monte-Carlo sampler.
    pub fn with_seed(self, seed: u64) -> Self {
        self.rng.replace(StdRng::seed_from_u64(seed));
        self
    }

    /// Choose the input-side Kronecker factor.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` unless the extension computes Kronecker factors.
    pub fn with_input_factor(mut self, input_factor: InputFactor) -> Result<Self, BackpropError> {
        if self.kind != ExtensionKind::Kronecker {
            return Err(BackpropError::InvalidConfiguration(format!(
                "input factor only applies to Kronecker extensions, not {}",
                self.savefield()
            )));
        }
        self.input_factor = input_factor;
        Ok(self)
    }

    /// # Errors
    ///
    /// `InvalidLossHessianStrategy` if the kind does not accept `strategy`.
    pub fn with_loss_hessian_strategy(mut self, strategy: LossHessianStrategy) -> Result<Self, BackpropError> {
        let valid = self.kind.valid_strategies();
        if !valid.contains(&strategy) {
            return Err(BackpropError::InvalidLossHessianStrategy {
                strategy,
                extension: format!("{:?}", self.kind),
                valid: valid.to_vec(),
            });
        }
        self.strategy = strategy;
        Ok(self)
    }

    /// # Errors
    ///
    /// `InvalidConfiguration` for zero samples.
    pub fn with_mc_samples(mut self, mc_samples: usize) -> Result<Self, BackpropError> {
        check_mc_samples(mc_samples)?;
        self.mc_samples = mc_samples;
        Ok(self)
    }

    /// Register (or replace) the derivative contract of layer type `M`.
    /// Parameter results go through `M`'s parameter-Jacobian products.
    pub fn with_module<M: Module>(mut self, derivatives: impl Derivatives + 'static) -> Self {
        self.registry.insert::<M>(derivatives, GenericExtractor);
        self
    }

    /// Register (or replace) the Hessian factorisation of loss type `L`.
    pub fn with_loss<L: Loss>(mut self, derivatives: impl LossDerivatives + 'static) -> Self {
        self.registry.insert_loss::<L>(derivatives);
        self
    }

    pub fn kind(&self) -> ExtensionKind {
        self.kind
    }

    pub fn loss_hessian_strategy(&self) -> LossHessianStrategy {
        self.strategy
    }

    pub fn mc_samples(&self) -> usize {
        self.mc_samples
    }

    pub fn subsampling(&self) -> Option<&[usize]> {
        self.subsampling.as_deref()
    }

    pub fn fail_mode(&self) -> FailMode {
        self.fail_mode
    }

    pub fn input_factor(&self) -> InputFactor {
        self.input_factor
    }

    /// Name of the parameter slot results are written to.
    pub fn savefield(&self) -> &'static str {
        let exact = self.strategy == LossHessianStrategy::Exact;
        match (self.kind, exact) {
            (ExtensionKind::DiagGgn, true) => "diag_ggn_exact",
            (ExtensionKind::DiagGgn, false) => "diag_ggn_mc",
            (ExtensionKind::BatchDiagGgn, true) => "diag_ggn_exact_batch",
            (ExtensionKind::BatchDiagGgn, false) => "diag_ggn_mc_batch",
            (ExtensionKind::DiagHessian, _) => "diag_h",
            (ExtensionKind::BatchDiagHessian, _) => "diag_h_batch",
            (ExtensionKind::BatchGrad, _) => "grad_batch",
            (ExtensionKind::Kronecker, true) => "kflr",
            (ExtensionKind::Kronecker, false) => "kfac",
        }
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn rng(&self) -> RefMut<'_, StdRng> {
        self.rng.borrow_mut()
    }
}

fn check_mc_samples(mc_samples: usize) -> Result<(), BackpropError> {
    if mc_samples == 0 {
        return Err(BackpropError::InvalidConfiguration(
            "mc_samples must be positive".to_string(),
        ));
    }
    Ok(())
}
