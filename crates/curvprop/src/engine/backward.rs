//! The backward sweep: ordinary gradients plus every active extension.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::visit::{Dfs, Reversed};
use tracing::debug;

use super::gradients::Gradients;
use super::graph::{LossVar, NodeId, NodeKind, Tape, Var};
use crate::error::BackpropError;
use crate::extensions::Extension;
use crate::extensions::dispatcher::{ModuleVisit, SweepState};
use crate::module::{ModuleGrads, ParamId, Parameter};
use crate::tensor::DenseTensor;

/// A module an extension skipped under `FailMode::Warn` or `Silent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedModule {
    pub node: NodeId,
    pub module: &'static str,
    /// Savefield of the extension that skipped it.
    pub extension: &'static str,
}

/// Summary of a completed sweep.
#[derive(Debug)]
pub struct SweepReport {
    /// Nodes visited, the loss included.
    pub visited: usize,
    pub skipped: Vec<SkippedModule>,
    input_grads: HashMap<NodeId, DenseTensor<f64>>,
}

impl SweepReport {
    /// Gradient of an input created with [`Tape::input_with_grad`].
    pub fn input_grad(&self, input: &Var) -> Option<&DenseTensor<f64>> {
        self.input_grads.get(&input.node())
    }
}

/// Nodes that feed the loss, in the order the sweep visits them: every
/// consumer before its producer.
fn sweep_order(tape: &Tape<'_>, loss: NodeId) -> Result<Vec<NodeId>, BackpropError> {
    let graph = tape.graph();
    let reversed = Reversed(graph);
    let mut dfs = Dfs::new(reversed, loss.0);
    let mut ancestors = HashSet::new();
    while let Some(node) = dfs.next(reversed) {
        ancestors.insert(node);
    }
    let order = toposort(graph, None).map_err(|cycle| BackpropError::CyclicGraph {
        node: cycle.node_id().index(),
    })?;
    Ok(order
        .into_iter()
        .rev()
        .filter(|n| ancestors.contains(n))
        .map(NodeId)
        .collect())
}

/// Run reverse-mode differentiation from `loss` and let every extension
/// visit each node once.
///
/// Gradients and extension results are written onto the parameters only if
/// the whole sweep succeeds. At that point every savefield of the given
/// extensions is first cleared on all parameters of the tape.
///
/// # Errors
///
/// `NotInGraph` if `loss` is from another tape, `DuplicateExtension` if two
/// extensions share a savefield, and any error raised by a module, loss or
/// extension during the sweep.
///
/// # Example
///
/// ```
/// use curvprop::{Extension, Linear, MSELoss, Reduction, Tape, Tensor, backward};
///
/// let layer = Linear::new(3, 2, true);
/// let loss_fn = MSELoss::new(Reduction::Mean);
///
/// let mut tape = Tape::new();
/// let x = tape.input(Tensor::ones(&[4, 3]));
/// let y = tape.apply(&layer, &x).unwrap();
/// let loss = tape.loss(&loss_fn, &y, &Tensor::zeros(&[4, 2])).unwrap();
///
/// let ggn = Extension::diag_ggn_exact();
/// backward(&tape, &loss, &[&ggn]).unwrap();
///
/// let diag = layer.weight().saved("diag_ggn_exact").unwrap();
/// assert_eq!(diag.shape(), &[2, 3]);
/// assert!(layer.weight().grad().is_some());
/// ```
pub fn backward(tape: &Tape<'_>, loss: &LossVar, extensions: &[&Extension]) -> Result<SweepReport, BackpropError> {
    tape.check_loss(loss)?;
    let mut savefields = HashSet::new();
    for ext in extensions {
        if !savefields.insert(ext.savefield()) {
            return Err(BackpropError::DuplicateExtension {
                savefield: ext.savefield().to_string(),
            });
        }
    }

    let order = sweep_order(tape, loss.node())?;
    let mut node_grads: Gradients<NodeId> = Gradients::new();
    let mut param_grads: Gradients<ParamId> = Gradients::new();
    let mut input_grads = HashMap::new();
    let mut states: Vec<SweepState<'_>> = extensions
        .iter()
        .map(|ext| SweepState::new(ext, tape.pass()))
        .collect();

    for &node in &order {
        let producer = tape.producer(node);
        // quantities are only handed on to nodes that can use them
        let module_producer = producer.filter(|p| matches!(tape.kind(*p), NodeKind::Module { .. }));
        match tape.kind(node) {
            NodeKind::Loss {
                loss: loss_fn,
                prediction,
                target,
            } => {
                let grad = loss_fn.gradient(prediction, target)?;
                if let Some(p) = producer {
                    node_grads.accumulate(p, grad)?;
                }
                for state in &mut states {
                    state.start_loss(node, *loss_fn, prediction, target, module_producer)?;
                }
                debug!(node = node.index(), loss = loss_fn.name(), "started backward sweep");
            }
            NodeKind::Module { module, io } => {
                let Some(grad_output) = node_grads.remove(&node) else {
                    continue;
                };
                let ModuleGrads { input, params } = module.backward(io, &grad_output)?;
                for (id, grad) in params {
                    param_grads.accumulate(id, grad)?;
                }
                if let Some(p) = producer {
                    node_grads.accumulate(p, input)?;
                }
                let visit = ModuleVisit {
                    node,
                    module: *module,
                    io,
                    grad_output: &grad_output,
                    producer: module_producer,
                };
                for state in &mut states {
                    state.visit_module(visit)?;
                }
                debug!(node = node.index(), module = module.name(), "visited module");
            }
            NodeKind::Input { requires_grad, .. } => {
                if let Some(grad) = node_grads.remove(&node).filter(|_| *requires_grad) {
                    input_grads.insert(node, grad);
                }
            }
        }
    }

    let skipped = commit(tape, states, param_grads);
    debug!(
        visited = order.len(),
        extensions = extensions.len(),
        skipped = skipped.len(),
        "committed backward sweep"
    );
    Ok(SweepReport {
        visited: order.len(),
        skipped,
        input_grads,
    })
}

/// Write gradients and extension results onto the tape's parameters.
fn commit(
    tape: &Tape<'_>,
    states: Vec<SweepState<'_>>,
    param_grads: Gradients<ParamId>,
) -> Vec<SkippedModule> {
    let mut params: HashMap<ParamId, &Parameter> = HashMap::new();
    for module in tape.modules() {
        for (_, param) in module.parameters() {
            params.entry(param.id()).or_insert(param);
        }
    }

    for param in params.values() {
        for state in &states {
            param.clear_saved(state.extension().savefield());
        }
    }
    for (id, grad) in param_grads.into_map() {
        if let Some(param) = params.get(&id) {
            param.set_grad(Some(grad));
        }
    }

    let mut skipped = Vec::new();
    for state in states {
        let savefield = state.extension().savefield();
        let (results, mut state_skipped) = state.finish();
        for (id, value) in results {
            if let Some(param) = params.get(&id) {
                param.store(savefield, value);
            }
        }
        skipped.append(&mut state_skipped);
    }
    skipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Linear, MSELoss, ReLU, Reduction};
    use crate::module::Loss;
    use approx::assert_relative_eq;

    #[test]
    fn test_gradients_match_module_backward() {
        let layer = Linear::new(3, 2, true);
        let mse = MSELoss::new(Reduction::Sum);
        let x = DenseTensor::from_fn(&[2, 3], |i| (i[0] + 2 * i[1]) as f64 * 0.1);
        let target = DenseTensor::zeros(&[2, 2]);

        let mut tape = Tape::new();
        let input = tape.input_with_grad(x.clone());
        let y = tape.apply(&layer, &input).unwrap();
        let loss = tape.loss(&mse, &y, &target).unwrap();
        let report = backward(&tape, &loss, &[]).unwrap();
        assert_eq!(report.visited, 3);
        assert!(report.skipped.is_empty());

        let io = crate::module::ModuleIo {
            output: y.value().clone(),
            input: x,
        };
        let g = mse.gradient(y.value(), &target).unwrap();
        let expected = crate::module::Module::backward(&layer, &io, &g).unwrap();
        let grad_w = layer.weight().grad().unwrap();
        assert!(grad_w.max_abs_diff(&expected.params[0].1).unwrap() < 1e-14);
        let grad_x = report.input_grad(&input).unwrap();
        assert!(grad_x.max_abs_diff(&expected.input).unwrap() < 1e-14);
    }

    #[test]
    fn test_only_loss_ancestors_are_visited() {
        let layer = Linear::from_tensors(DenseTensor::ones(&[1, 2]), None).unwrap();
        let mse = MSELoss::new(Reduction::Sum);
        let mut tape = Tape::new();
        let x = tape.input(DenseTensor::ones(&[1, 2]));
        let h = tape.apply(&ReLU, &x).unwrap();
        let a = tape.apply(&layer, &h).unwrap();
        let _b = tape.apply(&layer, &h).unwrap();
        let loss = tape.loss(&mse, &a, &DenseTensor::zeros(&[1, 1])).unwrap();
        let report = backward(&tape, &loss, &[]).unwrap();
        assert_eq!(tape.len(), 5);
        assert_eq!(report.visited, 4);
        assert_relative_eq!(layer.weight().grad().unwrap().data()[0], 4.0);
    }

    #[test]
    fn test_duplicate_extension_rejected() {
        let layer = Linear::new(2, 1, false);
        let mse = MSELoss::new(Reduction::Sum);
        let mut tape = Tape::new();
        let x = tape.input(DenseTensor::ones(&[1, 2]));
        let y = tape.apply(&layer, &x).unwrap();
        let loss = tape.loss(&mse, &y, &DenseTensor::zeros(&[1, 1])).unwrap();
        let a = Extension::diag_ggn_exact();
        let b = Extension::diag_ggn_exact();
        let err = backward(&tape, &loss, &[&a, &b]).unwrap_err();
        assert!(matches!(err, BackpropError::DuplicateExtension { .. }));
        assert!(layer.weight().grad().is_none());
    }

    #[test]
    fn test_foreign_loss_rejected() {
        let layer = Linear::new(2, 1, false);
        let mse = MSELoss::new(Reduction::Sum);
        let mut tape = Tape::new();
        let x = tape.input(DenseTensor::ones(&[1, 2]));
        let y = tape.apply(&layer, &x).unwrap();
        let loss = tape.loss(&mse, &y, &DenseTensor::zeros(&[1, 1])).unwrap();
        let other: Tape<'_> = Tape::new();
        assert!(matches!(
            backward(&other, &loss, &[]),
            Err(BackpropError::NotInGraph { .. })
        ));
    }
}
