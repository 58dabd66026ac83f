//! Explicit reverse traversal of a recorded forward pass.
//!
//! ```text
//! Tape::apply / Tape::loss      record nodes (pre-forward hook, forward)
//! backward(&tape, &loss, exts)  reverse topological sweep
//!     loss node    -> loss gradient, extensions start their quantity
//!     module node  -> Module::backward, then each extension visits once
//!     commit       -> gradients and savefields written onto parameters
//! ```

mod backward;
mod gradients;
mod graph;

pub use backward::{SkippedModule, SweepReport, backward};
pub use graph::{LossVar, NodeId, PassId, Tape, Var};
pub(crate) use graph::NodeKind;
