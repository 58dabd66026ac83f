//! Recorded computation graph of one forward pass.

use std::sync::atomic::{AtomicUsize, Ordering};

use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::BackpropError;
use crate::module::{Loss, Module, ModuleIo};
use crate::tensor::DenseTensor;

static NEXT_PASS_ID: AtomicUsize = AtomicUsize::new(0);

/// Identifier of one forward pass (one [`Tape`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassId(usize);

impl PassId {
    fn fresh() -> Self {
        Self(NEXT_PASS_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the internal index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Position of a node on its tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) NodeIndex);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

/// What a tape node computed.
#[derive(Debug)]
pub(crate) enum NodeKind<'m> {
    Input {
        value: DenseTensor<f64>,
        requires_grad: bool,
    },
    Module {
        module: &'m dyn Module,
        io: ModuleIo,
    },
    Loss {
        loss: &'m dyn Loss,
        prediction: DenseTensor<f64>,
        target: DenseTensor<f64>,
    },
}

/// A tensor produced on a tape.
#[derive(Debug, Clone)]
pub struct Var {
    node: NodeId,
    pass: PassId,
    value: DenseTensor<f64>,
}

impl Var {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn value(&self) -> &DenseTensor<f64> {
        &self.value
    }
}

/// The scalar loss terminating a tape.
#[derive(Debug, Clone)]
pub struct LossVar {
    node: NodeId,
    pass: PassId,
    value: f64,
}

impl LossVar {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Computation graph of one forward pass.
///
/// Edges point from a producer to its consumer. Modules are borrowed for the
/// tape's lifetime, so results can be written back onto their parameters
/// after the backward sweep.
#[derive(Debug)]
pub struct Tape<'m> {
    pass: PassId,
    graph: DiGraph<NodeKind<'m>, ()>,
}

impl Default for Tape<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'m> Tape<'m> {
    /// Empty tape with a fresh [`PassId`].
    pub fn new() -> Self {
        Self {
            pass: PassId::fresh(),
            graph: DiGraph::new(),
        }
    }

    pub fn pass(&self) -> PassId {
        self.pass
    }

    /// Number of recorded nodes.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Data leaf without gradient.
    pub fn input(&mut self, value: DenseTensor<f64>) -> Var {
        self.leaf(value, false)
    }

    /// Data leaf whose gradient is reported by the backward sweep.
    pub fn input_with_grad(&mut self, value: DenseTensor<f64>) -> Var {
        self.leaf(value, true)
    }

    fn leaf(&mut self, value: DenseTensor<f64>, requires_grad: bool) -> Var {
        let node = NodeId(self.graph.add_node(NodeKind::Input {
            value: value.clone(),
            requires_grad,
        }));
        Var {
            node,
            pass: self.pass,
            value,
        }
    }

    fn check_owned(&self, pass: PassId, node: NodeId) -> Result<(), BackpropError> {
        if pass != self.pass || node.index() >= self.graph.node_count() {
            return Err(BackpropError::NotInGraph { node: node.index() });
        }
        Ok(())
    }

    /// Run `module` on `input`: pre-forward hook, forward, then record the
    /// input/output pair.
    ///
    /// # Errors
    ///
    /// `NotInGraph` if `input` belongs to another tape, otherwise whatever
    /// the hook or forward raise.
    pub fn apply(&mut self, module: &'m dyn Module, input: &Var) -> Result<Var, BackpropError> {
        self.check_owned(input.pass, input.node)?;
        module.forward_pre_hook(self.pass, &input.value)?;
        let output = module.forward(&input.value)?;
        let node = NodeId(self.graph.add_node(NodeKind::Module {
            module,
            io: ModuleIo {
                input: input.value.clone(),
                output: output.clone(),
            },
        }));
        self.graph.add_edge(input.node.0, node.0, ());
        Ok(Var {
            node,
            pass: self.pass,
            value: output,
        })
    }

    /// Evaluate `loss` on `prediction` and record it.
    ///
    /// # Errors
    ///
    /// `NotInGraph` for a foreign `prediction`, otherwise errors of
    /// [`Loss::forward`].
    pub fn loss(
        &mut self,
        loss: &'m dyn Loss,
        prediction: &Var,
        target: &DenseTensor<f64>,
    ) -> Result<LossVar, BackpropError> {
        self.check_owned(prediction.pass, prediction.node)?;
        let value = loss.forward(&prediction.value, target)?;
        let node = NodeId(self.graph.add_node(NodeKind::Loss {
            loss,
            prediction: prediction.value.clone(),
            target: target.clone(),
        }));
        self.graph.add_edge(prediction.node.0, node.0, ());
        Ok(LossVar {
            node,
            pass: self.pass,
            value,
        })
    }

    pub(crate) fn check_loss(&self, loss: &LossVar) -> Result<(), BackpropError> {
        self.check_owned(loss.pass, loss.node)
    }

    pub(crate) fn graph(&self) -> &DiGraph<NodeKind<'m>, ()> {
        &self.graph
    }

    pub(crate) fn kind(&self, node: NodeId) -> &NodeKind<'m> {
        &self.graph[node.0]
    }

    /// Producer feeding `node`, if any.
    pub(crate) fn producer(&self, node: NodeId) -> Option<NodeId> {
        self.graph
            .neighbors_directed(node.0, petgraph::Direction::Incoming)
            .next()
            .map(NodeId)
    }

    /// Every module recorded on the tape, in recording order.
    pub(crate) fn modules(&self) -> impl Iterator<Item = &'m dyn Module> + '_ {
        self.graph.node_weights().filter_map(|kind| match kind {
            NodeKind::Module { module, .. } => Some(*module),
            _ => None,
        })
    }
}
