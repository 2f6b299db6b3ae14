//! # gluon-core
//!
//! Leaf types and process-wide scopes shared by every gluon crate.
//!
//! This crate provides:
//! - [`Context`]: a device (type + ordinal), with a scoped ambient default
//! - [`DType`] / [`Shape`]: element types and possibly-partial shapes
//! - [`NDArray`]: host-backed arrays with recorded ops for differentiation
//! - [`autograd`]: recording/training scopes, gradient attachment, backward
//! - [`NameManager`]: deterministic auto-naming with a scoped stack
//! - [`safetensors`]: name → array persistence
//! - [`Error`] / [`Result`]: the error type used across the workspace
//!
//! Scoped state (ambient context, autograd flags, name managers) is
//! thread-local. None of the types here are meant for unsynchronized
//! mutation from several threads at once.

pub mod autograd;
pub mod context;
pub mod dtype;
pub mod error;
pub mod name;
pub mod ndarray;
pub mod op;
pub mod safetensors;
pub mod shape;

pub use autograd::{GradReq, RecordingScope};
pub use context::{format_contexts, Context, ContextGuard, DeviceType};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use name::{NameManager, NameScope};
pub use ndarray::{NDArray, Storage};
pub use op::{ArrayId, Op};
pub use shape::Shape;
