//! Error types for curvprop.

use thiserror::Error;

use crate::extensions::LossHessianStrategy;

/// Errors that can occur in tensor operations.
#[derive(Debug, Error)]
pub enum TensorError {
    /// Shape mismatch between data length and expected size.
    #[error("shape mismatch: expected {expected} elements, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Index out of bounds.
    #[error("index out of bounds: index {index} is out of range for dimension {dim_size}")]
    IndexOutOfBounds { index: usize, dim_size: usize },

    /// Wrong number of indices provided.
    #[error("wrong number of indices: expected {expected}, got {actual}")]
    WrongNumberOfIndices { expected: usize, actual: usize },

    /// Invalid permutation.
    #[error("invalid permutation {perm:?} for tensor with {ndim} dimensions")]
    InvalidPermutation { perm: Vec<usize>, ndim: usize },

    /// Operation requires specific tensor rank.
    #[error("expected tensor of rank {expected}, got rank {actual}")]
    RankMismatch { expected: usize, actual: usize },

    /// Axis outside of `0..ndim`.
    #[error("axis {axis} out of range for tensor with {ndim} dimensions")]
    InvalidAxis { axis: usize, ndim: usize },

    /// Slice range out of bounds.
    #[error("slice range {start}..{end} out of bounds for dimension {dim} with size {size}")]
    SliceOutOfBounds {
        start: usize,
        end: usize,
        dim: usize,
        size: usize,
    },

    /// Two operands whose shapes cannot be combined by `op`.
    #[error("incompatible shapes for {op}: {lhs:?} vs {rhs:?}")]
    IncompatibleShapes {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
}

/// Errors raised while building extensions or running a backward sweep.
#[derive(Debug, Error)]
pub enum BackpropError {
    /// No handler is registered for a module under an `Error` fail mode.
    #[error("extension {extension} does not support module {module}")]
    UnsupportedLayer {
        module: &'static str,
        extension: String,
    },

    /// The requested loss-Hessian strategy is not valid for the extension.
    #[error(
        "loss Hessian strategy {strategy:?} is not valid for {extension}; valid strategies: {valid:?}"
    )]
    InvalidLossHessianStrategy {
        strategy: LossHessianStrategy,
        extension: String,
        valid: Vec<LossHessianStrategy>,
    },

    /// A subsampling index is not a valid batch position.
    #[error("subsampling index {index} out of range for batch of size {batch_size}")]
    InvalidSubsamplingIndex { index: usize, batch_size: usize },

    /// Parallel siblings disagree on inputs/bias, or a split does not add up.
    #[error("inconsistent parallel group: {reason}")]
    InconsistentParallelGroup { reason: String },

    /// Mean and sum reductions are numerically indistinguishable.
    #[error("cannot infer reduction factor: mean {mean} and sum {sum} are numerically equal")]
    ReductionAmbiguity { mean: f64, sum: f64 },

    /// The reduced loss matches neither the mean nor the sum of per-sample losses.
    #[error("reduced loss {loss} matches neither mean {mean} nor sum {sum} of per-sample losses")]
    ReductionMismatch { loss: f64, mean: f64, sum: f64 },

    /// A tensor reaching a derivative routine had an unexpected layout.
    #[error("{context}: expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Invalid user-supplied hyperparameter or settings value.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A handler received a module of a different concrete type.
    #[error("expected module {expected}, got {actual}")]
    ModuleTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// Parameter name not declared by the module.
    #[error("module {module} has no parameter named {param}")]
    UnknownParameter { module: &'static str, param: String },

    /// A second-derivative routine was requested from a layer that has none.
    #[error("module {module} provides no second derivative")]
    MissingSecondDerivative { module: &'static str },

    /// Two extensions in one sweep would write the same savefield.
    #[error("extension savefield {savefield} requested twice in one sweep")]
    DuplicateExtension { savefield: String },

    /// An extension reached the same node twice in one sweep.
    #[error("extension {extension} visited node {node} twice in one sweep")]
    DuplicateVisit { node: usize, extension: String },

    /// A variable or loss handle does not belong to the tape it was used with.
    #[error("node {node} does not belong to this tape")]
    NotInGraph { node: usize },

    /// The recorded graph is not acyclic.
    #[error("computation graph contains a cycle at node {node}")]
    CyclicGraph { node: usize },

    /// Tensor operation failed.
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Errors raised while loading [`ExtensionSettings`](crate::config::ExtensionSettings).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Settings file could not be read.
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    /// Settings are not valid JSON for the expected schema.
    #[error("failed to parse settings: {0}")]
    Json(#[from] serde_json::Error),

    /// Settings parsed but describe an invalid extension.
    #[error(transparent)]
    Invalid(#[from] BackpropError),
}
