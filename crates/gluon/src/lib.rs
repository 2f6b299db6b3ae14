//! # Gluon
//!
//! Imperative neural-network building blocks with deferred parameter
//! initialization.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use gluon::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `gluon-core` | NDArray, Shape, DType, Context, Error, autograd scopes, naming scopes, safetensors |
//! | `gluon-nn` | Parameter, ParameterDict, Block, HybridBlock, initializers, Dense, Activation, Sequential, losses |
//! | `gluon` | Optimizers, LR schedulers and the Trainer, plus this facade |
//!
//! ## Modules
//!
//! - [`optim`] — Optimizer trait, SGD, per-context updaters
//! - [`lr_scheduler`] — Factor and multi-factor learning rate schedules
//! - [`trainer`] — Trainer: applies an optimizer to a parameter list

/// Re-export core types.
pub use gluon_core::{
    autograd, bail, format_contexts, name, safetensors, Context, DType, Error, GradReq, NDArray, NameManager,
    RecordingScope, Result, Shape,
};

/// Re-export neural network blocks and parameters.
pub mod nn {
    pub use gluon_nn::*;
}

/// Learning rate schedules consulted by optimizers.
pub mod lr_scheduler;

/// Optimizers — update rules and per-context state.
pub mod optim;

/// Trainer — steps an optimizer over a parameter list.
pub mod trainer;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::nn::init::{Constant, Normal, One, Uniform, Xavier, Zero};
    pub use crate::nn::{
        Activation, ActivationKind, Block, Dense, DenseConfig, HybridBlock, HybridSequential, InitOptions,
        Initializer, L1Loss, L2Loss, LoadOptions, Loss, LossConfig, ParamAttrs, Parameter, ParameterDict,
        Sequential, SoftmaxCrossEntropyLoss, Symbol,
    };
    pub use crate::lr_scheduler::{FactorScheduler, LrScheduler, MultiFactorScheduler};
    pub use crate::optim::{Optimizer, Sgd, SgdConfig};
    pub use crate::trainer::{Trainer, TrainerConfig};
    pub use crate::{autograd, Context, DType, Error, GradReq, NDArray, RecordingScope, Result, Shape};
}
