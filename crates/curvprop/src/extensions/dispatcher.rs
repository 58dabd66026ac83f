//! Per-sweep state of one extension.
//!
//! The engine calls [`SweepState::start_loss`] at the loss node and
//! [`SweepState::visit_module`] at every module node, in reverse topological
//! order. Quantities travel from a node to its producer through the
//! `quantities` map; parameter results are accumulated here and handed back
//! to the engine, which commits them once the whole sweep succeeded.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use tracing::{trace, warn};

use super::extractor::{ParamExtractor, Site};
use super::quantity::{Quantity, Sign, SignedFactor};
use super::registry::Handler;
use super::{Extension, ExtensionKind, FailMode, LossHessianStrategy};
use crate::derivatives::{Derivatives, with_lead};
use crate::engine::{NodeId, PassId, SkippedModule};
use crate::error::BackpropError;
use crate::module::{Loss, Module, ModuleIo, ParamId, Parameter, SavedValue};
use crate::operations::{add_inplace, apply, diag_embed, mul, scale_inplace};
use crate::subsampling::{subsample, validate};
use crate::tensor::DenseTensor;

/// One visit of a module node.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ModuleVisit<'a> {
    pub node: NodeId,
    pub module: &'a dyn Module,
    pub io: &'a ModuleIo,
    pub grad_output: &'a DenseTensor<f64>,
    /// Module node that produced this module's input, if any.
    pub producer: Option<NodeId>,
}

#[derive(Debug)]
pub(crate) struct SweepState<'e> {
    extension: &'e Extension,
    pass: PassId,
    quantities: HashMap<NodeId, Quantity>,
    visited: HashSet<NodeId>,
    results: HashMap<ParamId, SavedValue>,
    skipped: Vec<SkippedModule>,
}

impl<'e> SweepState<'e> {
    pub(crate) fn new(extension: &'e Extension, pass: PassId) -> Self {
        Self {
            extension,
            pass,
            quantities: HashMap::new(),
            visited: HashSet::new(),
            results: HashMap::new(),
            skipped: Vec::new(),
        }
    }

    pub(crate) fn extension(&self) -> &'e Extension {
        self.extension
    }

    pub(crate) fn finish(self) -> (HashMap<ParamId, SavedValue>, Vec<SkippedModule>) {
        (self.results, self.skipped)
    }

    fn mark_visited(&mut self, node: NodeId) -> Result<(), BackpropError> {
        if !self.visited.insert(node) {
            return Err(BackpropError::DuplicateVisit {
                node: node.index(),
                extension: self.extension.savefield().to_string(),
            });
        }
        Ok(())
    }

    /// Apply the fail mode to a node without a handler.
    fn unsupported(&mut self, node: NodeId, name: &'static str) -> Result<(), BackpropError> {
        let extension = self.extension.savefield();
        match self.extension.fail_mode() {
            FailMode::Error => {
                return Err(BackpropError::UnsupportedLayer {
                    module: name,
                    extension: extension.to_string(),
                });
            }
            FailMode::Warn => {
                warn!(
                    module = name,
                    extension,
                    node = node.index(),
                    "no handler registered; skipping module"
                );
            }
            FailMode::Silent => {}
        }
        self.skipped.push(SkippedModule {
            node,
            module: name,
            extension,
        });
        Ok(())
    }

    /// Start the sweep at the loss node: factorise the loss Hessian and hand
    /// it to the prediction's producer.
    pub(crate) fn start_loss(
        &mut self,
        node: NodeId,
        loss: &dyn Loss,
        prediction: &DenseTensor<f64>,
        target: &DenseTensor<f64>,
        producer: Option<NodeId>,
    ) -> Result<(), BackpropError> {
        self.mark_visited(node)?;
        let extension = self.extension;
        let subsampling = extension.subsampling();
        validate(subsampling, prediction.shape().first().copied().unwrap_or(0))?;
        if !extension.kind().propagates_curvature() {
            return Ok(());
        }
        let Some(derivatives) = extension.registry().loss(loss) else {
            return self.unsupported(node, loss.name());
        };
        let factor = match extension.loss_hessian_strategy() {
            LossHessianStrategy::Exact => derivatives.sqrt_hessian(loss, prediction, target, subsampling)?,
            LossHessianStrategy::Sampling => derivatives.sqrt_hessian_sampled(
                loss,
                prediction,
                target,
                extension.mc_samples(),
                &mut extension.rng(),
                subsampling,
            )?,
        };
        if let Some(producer) = producer {
            self.send(producer, Quantity::single(node, factor))?;
        }
        Ok(())
    }

    fn send(&mut self, producer: NodeId, quantity: Quantity) -> Result<(), BackpropError> {
        match self.quantities.entry(producer) {
            Entry::Occupied(mut e) => e.get_mut().merge(quantity),
            Entry::Vacant(e) => {
                e.insert(quantity);
                Ok(())
            }
        }
    }

    pub(crate) fn visit_module(&mut self, visit: ModuleVisit<'_>) -> Result<(), BackpropError> {
        self.mark_visited(visit.node)?;
        let extension = self.extension;
        let params = visit.module.parameters();
        if extension.kind() == ExtensionKind::BatchGrad {
            if params.is_empty() {
                return Ok(());
            }
            let Some(handler) = extension.registry().handler(visit.module).cloned() else {
                return self.unsupported(visit.node, visit.module.name());
            };
            return self.batch_grad(&visit, &params, handler.derivatives.as_ref());
        }

        let Some(quantity) = self.quantities.remove(&visit.node) else {
            trace!(node = visit.node.index(), "no backpropagated quantity; nothing to do");
            return Ok(());
        };
        let Some(handler) = extension.registry().handler(visit.module).cloned() else {
            return self.unsupported(visit.node, visit.module.name());
        };
        let kronecker = extension.kind() == ExtensionKind::Kronecker;
        if kronecker && !params.is_empty() && !handler.extractor.supports_kronecker() {
            return self.unsupported(visit.node, visit.module.name());
        }

        let site = Site {
            module: visit.module,
            io: visit.io,
            pass: self.pass,
            subsampling: extension.subsampling(),
        };
        for (name, param) in &params {
            if kronecker {
                self.kronecker(site, handler.extractor.as_ref(), name, param.id(), &quantity)?;
            } else {
                self.diagonal(site, &handler, name, param.id(), &quantity)?;
            }
        }

        if let Some(producer) = visit.producer {
            let derivatives = handler.derivatives.as_ref();
            let mut back =
                quantity.try_map(|t| derivatives.jac_t_mat_prod(visit.module, visit.io, t, site.subsampling))?;
            if self.residual_enabled() && !derivatives.hessian_is_zero(visit.module) {
                for factor in residual_factors(derivatives, &visit, site.subsampling)? {
                    back.push(factor);
                }
            }
            self.send(producer, back)?;
        }
        Ok(())
    }

    fn residual_enabled(&self) -> bool {
        matches!(
            self.extension.kind(),
            ExtensionKind::DiagHessian | ExtensionKind::BatchDiagHessian
        )
    }

    fn diagonal(
        &mut self,
        site: Site<'_>,
        handler: &Handler,
        name: &str,
        id: ParamId,
        quantity: &Quantity,
    ) -> Result<(), BackpropError> {
        let sum_batch = self.extension.kind().sums_batch();
        for factor in quantity.factors() {
            let mut diag = handler
                .extractor
                .diagonal(handler.derivatives.as_ref(), site, name, &factor.tensor, sum_batch)?;
            if factor.sign == Sign::Minus {
                scale_inplace(&mut diag, -1.0);
            }
            self.accumulate(id, diag)?;
        }
        Ok(())
    }

    fn kronecker(
        &mut self,
        site: Site<'_>,
        extractor: &dyn ParamExtractor,
        name: &str,
        id: ParamId,
        quantity: &Quantity,
    ) -> Result<(), BackpropError> {
        let Some(stacked) = quantity.stacked_positive()? else {
            return Ok(());
        };
        let factors = extractor.kronecker_factors(site, name, &stacked, self.extension.input_factor())?;
        if let Some(SavedValue::Factors(existing)) = self.results.get_mut(&id) {
            if existing.len() == factors.len() {
                for (acc, f) in existing.iter_mut().zip(&factors) {
                    add_inplace(acc, f)?;
                }
                return Ok(());
            }
        }
        self.results.insert(id, SavedValue::Factors(factors));
        Ok(())
    }

    /// `grad_batch[n] = J_θᵀ g[n]` for the subsampled rows of the output
    /// gradient.
    fn batch_grad(
        &mut self,
        visit: &ModuleVisit<'_>,
        params: &[(String, &Parameter)],
        derivatives: &dyn Derivatives,
    ) -> Result<(), BackpropError> {
        let subsampling = self.extension.subsampling();
        let g = subsample(visit.grad_output, subsampling)?;
        let n = g.dim(0);
        let mat = g.reshape(&with_lead(&[n, 1], &g.shape()[1..]))?;
        for (name, param) in params {
            let jtg = derivatives.param_jac_t_mat_prod(visit.module, visit.io, name, &mat, false, subsampling)?;
            let per_sample = jtg.reshape(&with_lead(&[n], param.shape()))?;
            self.accumulate(param.id(), per_sample)?;
        }
        Ok(())
    }

    fn accumulate(&mut self, id: ParamId, value: DenseTensor<f64>) -> Result<(), BackpropError> {
        if let Some(SavedValue::Tensor(acc)) = self.results.get_mut(&id) {
            add_inplace(acc, &value)?;
            return Ok(());
        }
        self.results.insert(id, SavedValue::Tensor(value));
        Ok(())
    }
}

/// Residual `R = f'' ⊙ g` of an elementwise layer, as `+diag(√R₊)` and
/// `-diag(√R₋)`.
fn residual_factors(
    derivatives: &dyn Derivatives,
    visit: &ModuleVisit<'_>,
    subsampling: Option<&[usize]>,
) -> Result<Vec<SignedFactor>, BackpropError> {
    let d2f = derivatives.d2f(visit.module, visit.io, subsampling)?;
    let g = subsample(visit.grad_output, subsampling)?;
    let residual = mul(&d2f, &g)?;
    let positive = diag_embed(&apply(&residual, |r| r.max(0.0).sqrt()))?;
    let negative = diag_embed(&apply(&residual, |r| (-r).max(0.0).sqrt()))?;
    Ok(vec![
        SignedFactor {
            origin: visit.node,
            sign: Sign::Plus,
            tensor: positive,
        },
        SignedFactor {
            origin: visit.node,
            sign: Sign::Minus,
            tensor: negative,
        },
    ])
}
