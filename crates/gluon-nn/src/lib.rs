//! # gluon-nn
//!
//! Learnable parameters and the blocks that own them.
//!
//! 1. **Parameter**: a named array with deferred initialization, one data
//!    and gradient replica per context
//! 2. **ParameterDict**: prefixed, shareable registry with save/load
//! 3. **Initializers**: Zero, One, Constant, Uniform, Normal, Xavier
//! 4. **Block / HybridBlock**: the layer interface with scoped naming,
//!    parameter collection and symbolic shape inference
//! 5. **Layers**: Dense, Activation, Sequential, HybridSequential
//! 6. **Losses**: L1Loss, L2Loss, SoftmaxCrossEntropyLoss
//!
//! Blocks are single-threaded objects; parameters are `Send + Sync`
//! handles so optimizers may hold them.

pub mod activation;
pub mod block;
pub mod dense;
pub mod hybrid;
pub mod init;
pub mod loss;
pub mod parameter;
pub mod parameter_dict;
pub mod sequential;
pub mod symbol;

pub use activation::{Activation, ActivationKind};
pub use block::{current_scope_prefix, Block, BlockCore, BlockScopeGuard, ChildRef, ParamRef};
pub use dense::{Dense, DenseConfig};
pub use hybrid::{HybridBlock, HybridInput, HybridOutput, ParamData};
pub use init::{InitDesc, InitRef, Initializer};
pub use loss::{L1Loss, L2Loss, Loss, LossConfig, SoftmaxCrossEntropyLoss};
pub use parameter::{InitOptions, ParamAttrs, ParamState, Parameter};
pub use parameter_dict::{LoadOptions, ParameterDict};
pub use sequential::{HybridSequential, Sequential};
pub use symbol::Symbol;
