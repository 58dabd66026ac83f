//! curvprop - curvature backpropagation for small neural networks
//!
//! This crate runs an ordinary reverse-mode backward pass over a recorded
//! forward pass and, alongside it, propagates matrix square roots of the
//! loss curvature layer by layer. The result is per-parameter curvature
//! information (diagonal GGN/Fisher, Hessian diagonals, Kronecker factors)
//! and per-sample gradients, without ever forming a full Hessian.
//!
//! # Architecture
//!
//! ```text
//! Level 1: Extensions (extensions, config)
//!     → what to compute: diag GGN, diag Hessian, KFAC/KFLR, batch grad
//!
//! Level 2: Engine (engine)
//!     → Tape records the forward pass, backward() sweeps it once
//!
//! Level 3: Derivative contracts (derivatives, diag, subsampling)
//!     → Jacobian products and closed-form diagonals per layer type
//!
//! Level 4: Tensors (tensor, operations, backend)
//!     → dense row-major tensors, faer matrix kernels
//! ```
//!
//! # Example
//!
//! ```
//! use curvprop::{Extension, Linear, MSELoss, ReLU, Reduction, Sequential, Tape, Tensor, backward};
//!
//! let model = Sequential::new()
//!     .with(Linear::new(4, 8, true))
//!     .with(ReLU)
//!     .with(Linear::new(8, 2, true));
//! let loss_fn = MSELoss::new(Reduction::Mean);
//!
//! let mut tape = Tape::new();
//! let x = tape.input(Tensor::ones(&[5, 4]));
//! let y = model.forward(&mut tape, &x).unwrap();
//! let loss = tape.loss(&loss_fn, &y, &Tensor::zeros(&[5, 2])).unwrap();
//!
//! let ggn = Extension::diag_ggn_exact();
//! let per_sample = Extension::batch_grad();
//! backward(&tape, &loss, &[&ggn, &per_sample]).unwrap();
//!
//! let first: &Linear = model.layer(0).unwrap();
//! assert_eq!(first.weight().saved("diag_ggn_exact").unwrap().shape(), &[8, 4]);
//! assert_eq!(first.weight().saved("grad_batch").unwrap().shape(), &[5, 8, 4]);
//! ```

pub mod backend;
pub mod config;
pub mod derivatives;
pub(crate) mod diag;
pub mod engine;
pub mod error;
pub mod extensions;
pub mod module;
pub mod operations;
pub mod random;
pub mod scalar;
pub mod storage;
pub mod strides;
pub mod subsampling;
pub mod tensor;
pub mod unfold;

pub use config::ExtensionSettings;
pub use engine::{LossVar, NodeId, PassId, SkippedModule, SweepReport, Tape, Var, backward};
pub use error::{BackpropError, ConfigError, TensorError};
pub use extensions::{Extension, ExtensionKind, FailMode, InputFactor, LossHessianStrategy};
pub use module::{
    Conv, ConvOptions, CrossEntropyLoss, Dropout, Flatten, Linear, Loss, MSELoss, MeanInputBuffer, Module,
    ModuleGrads, ModuleIo, ParallelLinear, ParamId, Parameter, Pointwise, ReLU, Reduction, ReductionTolerance,
    SavedValue, Sequential, Sigmoid, Softplus, Tanh, infer_reduction_factor,
};
pub use scalar::Scalar;
pub use storage::Dense;
pub use tensor::{DenseTensor, Tensor};
