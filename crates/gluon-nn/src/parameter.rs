// Parameter — A named learnable array with a lazy lifecycle
//
// A Parameter is declared long before it has data. It moves through three
// states:
//
//   Uninitialized ──init()──► Deferred ──finish_deferred_init()──► Materialized
//                      │                     (once the shape is known)
//                      └── shape already known: straight to Materialized
//
// Materialization allocates a zero array on cpu(0), runs the initializer on
// it with autograd paused, then copies the result to every requested
// context. Each replica is independent; replicas on different contexts hold
// equal values right after init but are updated separately afterwards.
//
// GRADIENTS:
//
// Unless grad_req is `null`, every data replica gets a zeroed gradient
// replica of the same shape, dtype and context, registered with autograd so
// that backward writes (or accumulates) into it.
//
// SHARING:
//
// `Parameter` is a cheap handle (`Arc<RwLock<..>>`). Clones refer to the
// same parameter; equality is identity. Blocks that share a
// ParameterDict hand out the same Parameter to each of them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use gluon_core::autograd;
use gluon_core::{format_contexts, Context, DType, Error, GradReq, NDArray, RecordingScope, Result, Shape};

use crate::init::{ConstantArray, InitDesc, InitRef, Initializer, Uniform};
use crate::symbol::Symbol;

/// Observable lifecycle state of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamState {
    Uninitialized,
    Deferred,
    Materialized,
}

/// Declared attributes of a parameter.
///
/// Every field is optional: `Parameter::new` fills the gaps with defaults,
/// and `ParameterDict::get` only checks the fields that were given.
#[derive(Clone, Debug, Default)]
pub struct ParamAttrs {
    pub shape: Option<Shape>,
    pub dtype: Option<DType>,
    pub grad_req: Option<GradReq>,
    pub lr_mult: Option<f64>,
    pub wd_mult: Option<f64>,
    pub init: Option<InitRef>,
    pub allow_deferred_init: Option<bool>,
    pub differentiable: Option<bool>,
}

impl ParamAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declared shape. A `0` dimension means "unknown until inferred".
    pub fn with_shape(mut self, shape: impl Into<Shape>) -> Self {
        self.shape = Some(shape.into());
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_grad_req(mut self, grad_req: GradReq) -> Self {
        self.grad_req = Some(grad_req);
        self
    }

    pub fn with_lr_mult(mut self, lr_mult: f64) -> Self {
        self.lr_mult = Some(lr_mult);
        self
    }

    pub fn with_wd_mult(mut self, wd_mult: f64) -> Self {
        self.wd_mult = Some(wd_mult);
        self
    }

    pub fn with_init(self, init: impl Initializer + 'static) -> Self {
        self.with_init_ref(Arc::new(init))
    }

    pub fn with_init_ref(mut self, init: InitRef) -> Self {
        self.init = Some(init);
        self
    }

    pub fn with_allow_deferred_init(mut self, allow: bool) -> Self {
        self.allow_deferred_init = Some(allow);
        self
    }

    pub fn with_differentiable(mut self, differentiable: bool) -> Self {
        self.differentiable = Some(differentiable);
        self
    }
}

/// Options for [`Parameter::init`] and `ParameterDict::init`.
#[derive(Clone, Debug, Default)]
pub struct InitOptions {
    /// Initializer to use instead of the parameter's own.
    pub init: Option<InitRef>,
    /// Contexts to materialize on. Defaults to the ambient context.
    pub contexts: Option<Vec<Context>>,
    /// Used when neither `init` nor the parameter's own initializer is set.
    /// Defaults to `Uniform::default()`.
    pub default_init: Option<InitRef>,
    pub force_reinit: bool,
}

impl InitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_init(mut self, init: impl Initializer + 'static) -> Self {
        self.init = Some(Arc::new(init));
        self
    }

    pub fn with_default_init(mut self, init: impl Initializer + 'static) -> Self {
        self.default_init = Some(Arc::new(init));
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.contexts = Some(vec![context]);
        self
    }

    pub fn with_contexts(mut self, contexts: impl Into<Vec<Context>>) -> Self {
        self.contexts = Some(contexts.into());
        self
    }

    pub fn with_force_reinit(mut self, force: bool) -> Self {
        self.force_reinit = force;
        self
    }
}

struct Deferred {
    init: Option<InitRef>,
    contexts: Vec<Context>,
    default_init: InitRef,
    /// Data supplied through `set_data` before materialization.
    data: Option<NDArray>,
}

struct Replicas {
    contexts: Vec<Context>,
    data: Vec<NDArray>,
    grad: Option<Vec<NDArray>>,
    index: HashMap<Context, usize>,
}

enum State {
    Uninitialized,
    Deferred(Deferred),
    Materialized(Replicas),
}

#[derive(Clone, Copy)]
enum Slot {
    Data,
    Grad,
}

struct ParameterInner {
    name: String,
    shape: Option<Shape>,
    dtype: DType,
    grad_req: GradReq,
    lr_mult: f64,
    wd_mult: f64,
    init: Option<InitRef>,
    allow_deferred_init: bool,
    differentiable: bool,
    state: State,
}

impl ParameterInner {
    fn shape_str(&self) -> String {
        self.shape
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "None".to_string())
    }

    fn can_materialize(&self) -> bool {
        self.shape.as_ref().map_or(false, |s| s.elem_count() > 0)
    }

    fn replicas(&self) -> Result<&Replicas> {
        match &self.state {
            State::Materialized(r) => Ok(r),
            State::Deferred(_) => Err(Error::DeferredInit {
                name: self.name.clone(),
            }),
            State::Uninitialized => Err(Error::Uninitialized {
                name: self.name.clone(),
            }),
        }
    }

    fn get(&self, context: Option<Context>, slot: Slot) -> Result<NDArray> {
        let r = self.replicas()?;
        let arrays = match slot {
            Slot::Data => &r.data,
            Slot::Grad => r.grad.as_ref().ok_or_else(|| Error::NullGradient {
                name: self.name.clone(),
            })?,
        };
        let context = match context {
            Some(c) => c,
            None if arrays.len() == 1 => return Ok(arrays[0].clone()),
            None => Context::current(),
        };
        r.index
            .get(&context)
            .map(|&i| arrays[i].clone())
            .ok_or_else(|| Error::ContextMismatch {
                name: self.name.clone(),
                context: context.to_string(),
                available: format_contexts(&r.contexts),
            })
    }

    fn set_shape(&mut self, new: Shape) -> Result<()> {
        if let Some(old) = &self.shape {
            if !old.is_compatible(&new) {
                return Err(Error::invalid_shape(
                    &self.name,
                    format!("expected shape {old} is incompatible with given shape {new}"),
                ));
            }
        }
        self.shape = Some(new);
        Ok(())
    }

    /// Complete a pending deferred initialization. No-op in any other state.
    fn materialize(&mut self) -> Result<()> {
        let (init, contexts, default_init, data) = match &self.state {
            State::Deferred(d) => (
                d.init.clone(),
                d.contexts.clone(),
                Arc::clone(&d.default_init),
                d.data.clone(),
            ),
            _ => return Ok(()),
        };
        let shape = match &self.shape {
            Some(s) if s.elem_count() > 0 => s.clone(),
            _ => {
                return Err(Error::invalid_shape(
                    &self.name,
                    format!(
                        "cannot initialize parameter because it has invalid shape {}",
                        self.shape_str()
                    ),
                ))
            }
        };

        let _pause = RecordingScope::pause(false);
        let data = match data {
            Some(src) => {
                if src.shape() != &shape {
                    return Err(Error::invalid_shape(
                        &self.name,
                        format!("data of shape {} does not match declared shape {shape}", src.shape()),
                    ));
                }
                src.astype(self.dtype)?
            }
            None => {
                let arr = NDArray::zeros(shape, self.dtype, Context::cpu(0))?;
                let desc = InitDesc::new(self.name.as_str());
                let desc = match init {
                    Some(init) => desc.with_override(init),
                    None => desc,
                };
                default_init.apply(&desc, &arr)?;
                arr
            }
        };
        self.init_impl(data, &contexts)?;
        debug!(
            param = %self.name,
            shape = %self.shape_str(),
            contexts = %format_contexts(&contexts),
            "materialized parameter"
        );
        Ok(())
    }

    /// Replace the state with replicas of `data` on `contexts`.
    fn init_impl(&mut self, data: NDArray, contexts: &[Context]) -> Result<()> {
        if contexts.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "parameter '{}' needs at least one context",
                self.name
            )));
        }
        let mut index = HashMap::with_capacity(contexts.len());
        for (i, &ctx) in contexts.iter().enumerate() {
            if index.insert(ctx, i).is_some() {
                return Err(Error::InvalidArgument(format!(
                    "parameter '{}' was given context {ctx} more than once",
                    self.name
                )));
            }
        }
        let replicas = contexts
            .iter()
            .map(|&ctx| data.copy_to(ctx))
            .collect::<Result<Vec<_>>>()?;
        let mut r = Replicas {
            contexts: contexts.to_vec(),
            data: replicas,
            grad: None,
            index,
        };
        init_grad(&mut r, self.grad_req)?;
        if let State::Materialized(old) = &self.state {
            autograd::unmark_variables(&old.data);
        }
        self.state = State::Materialized(r);
        Ok(())
    }

    /// Mean of all data replicas, on cpu(0).
    fn reduce(&self) -> Result<NDArray> {
        let r = self.replicas()?;
        let cpu = Context::cpu(0);
        if r.data.len() == 1 {
            return r.data[0].copy_to(cpu);
        }
        let first = &r.data[0];
        let mut acc = vec![0.0; first.elem_count()];
        for replica in &r.data {
            for (a, v) in acc.iter_mut().zip(replica.to_f64_vec()?) {
                *a += v;
            }
        }
        let n = r.data.len() as f64;
        acc.iter_mut().for_each(|a| *a /= n);
        NDArray::from_f64_slice(&acc, first.shape().clone(), self.dtype, cpu)
    }

    fn check_loadable(&self, data: &NDArray, contexts: Option<&[Context]>) -> Result<()> {
        if let Some(shape) = &self.shape {
            if !shape.is_compatible(data.shape()) {
                return Err(Error::Persistence(format!(
                    "failed loading parameter '{}' from saved params: shape incompatible, expected {shape} vs saved {}",
                    self.name,
                    data.shape()
                )));
            }
        }
        if self.dtype != data.dtype() {
            return Err(Error::Persistence(format!(
                "failed loading parameter '{}' from saved params: dtype incompatible, expected {} vs saved {}",
                self.name,
                self.dtype,
                data.dtype()
            )));
        }
        let current = match &self.state {
            State::Materialized(r) => Some(&r.contexts),
            State::Deferred(d) => Some(&d.contexts),
            State::Uninitialized => None,
        };
        if let (Some(requested), Some(current)) = (contexts, current) {
            if !same_context_set(requested, current) {
                return Err(Error::Persistence(format!(
                    "failed to load parameter '{}' on {} because it was previously initialized on {}",
                    self.name,
                    format_contexts(requested),
                    format_contexts(current)
                )));
            }
        }
        Ok(())
    }

    fn load_init(&mut self, data: &NDArray, contexts: Option<&[Context]>) -> Result<()> {
        self.check_loadable(data, contexts)?;
        self.shape = Some(data.shape().clone());
        let _pause = RecordingScope::pause(false);
        let targets = match &self.state {
            State::Materialized(r) => {
                for replica in &r.data {
                    replica.copy_from(data)?;
                }
                return Ok(());
            }
            State::Deferred(d) => d.contexts.clone(),
            State::Uninitialized => contexts
                .map(|c| c.to_vec())
                .unwrap_or_else(|| vec![Context::cpu(0)]),
        };
        self.init_impl(data.clone(), &targets)
    }
}

fn init_grad(r: &mut Replicas, req: GradReq) -> Result<()> {
    if req == GradReq::Null {
        autograd::unmark_variables(&r.data);
        r.grad = None;
        return Ok(());
    }
    let grads = r
        .data
        .iter()
        .map(|d| NDArray::zeros(d.shape().clone(), d.dtype(), d.context()))
        .collect::<Result<Vec<_>>>()?;
    autograd::mark_variables(&r.data, &grads, &vec![req; grads.len()])?;
    r.grad = Some(grads);
    Ok(())
}

fn same_context_set(a: &[Context], b: &[Context]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    a.dedup();
    b.sort();
    b.dedup();
    a == b
}

/// A named learnable array. See the module docs for the lifecycle.
#[derive(Clone)]
pub struct Parameter {
    inner: Arc<RwLock<ParameterInner>>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, attrs: ParamAttrs) -> Self {
        let differentiable = attrs.differentiable.unwrap_or(true);
        let grad_req = if differentiable {
            attrs.grad_req.unwrap_or_default()
        } else {
            GradReq::Null
        };
        Parameter {
            inner: Arc::new(RwLock::new(ParameterInner {
                name: name.into(),
                shape: attrs.shape,
                dtype: attrs.dtype.unwrap_or_default(),
                grad_req,
                lr_mult: attrs.lr_mult.unwrap_or(1.0),
                wd_mult: attrs.wd_mult.unwrap_or(1.0),
                init: attrs.init,
                allow_deferred_init: attrs.allow_deferred_init.unwrap_or(false),
                differentiable,
                state: State::Uninitialized,
            })),
        }
    }

    /// A non-differentiable parameter that always initializes to `value`.
    pub fn constant(name: impl Into<String>, value: NDArray) -> Self {
        let attrs = ParamAttrs::new()
            .with_shape(value.shape().clone())
            .with_dtype(value.dtype())
            .with_grad_req(GradReq::Null)
            .with_differentiable(false)
            .with_init(ConstantArray::new(value));
        Parameter::new(name, attrs)
    }

    pub fn name(&self) -> String {
        self.inner.read().name.clone()
    }

    pub fn shape(&self) -> Option<Shape> {
        self.inner.read().shape.clone()
    }

    /// Refine the declared shape. Each known dimension must agree with the
    /// new shape; unknown (`0`) dimensions may take any value.
    pub fn set_shape(&self, shape: impl Into<Shape>) -> Result<()> {
        self.inner.write().set_shape(shape.into())
    }

    pub fn dtype(&self) -> DType {
        self.inner.read().dtype
    }

    pub fn grad_req(&self) -> GradReq {
        self.inner.read().grad_req
    }

    pub fn lr_mult(&self) -> f64 {
        self.inner.read().lr_mult
    }

    pub fn set_lr_mult(&self, lr_mult: f64) {
        self.inner.write().lr_mult = lr_mult;
    }

    pub fn wd_mult(&self) -> f64 {
        self.inner.read().wd_mult
    }

    pub fn set_wd_mult(&self, wd_mult: f64) {
        self.inner.write().wd_mult = wd_mult;
    }

    pub fn init_ref(&self) -> Option<InitRef> {
        self.inner.read().init.clone()
    }

    pub fn set_init(&self, init: Option<InitRef>) {
        self.inner.write().init = init;
    }

    pub fn allow_deferred_init(&self) -> bool {
        self.inner.read().allow_deferred_init
    }

    pub fn differentiable(&self) -> bool {
        self.inner.read().differentiable
    }

    pub fn state(&self) -> ParamState {
        match self.inner.read().state {
            State::Uninitialized => ParamState::Uninitialized,
            State::Deferred(_) => ParamState::Deferred,
            State::Materialized(_) => ParamState::Materialized,
        }
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &Parameter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Initialize data and gradient arrays.
    ///
    /// The initializer is `opts.init`, else the parameter's own, else
    /// `opts.default_init`. If the shape is not fully known the work is
    /// deferred (when allowed) until [`finish_deferred_init`] runs.
    /// Re-initializing a materialized parameter without `force_reinit`
    /// logs a warning and keeps the existing values.
    ///
    /// [`finish_deferred_init`]: Parameter::finish_deferred_init
    pub fn init(&self, opts: InitOptions) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if matches!(inner.state, State::Materialized(_)) && !opts.force_reinit {
            warn!(
                param = %inner.name,
                "parameter is already initialized, ignoring; set force_reinit to re-initialize"
            );
            return Ok(());
        }
        let contexts = opts.contexts.unwrap_or_else(|| vec![Context::current()]);
        if contexts.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "parameter '{}' needs at least one context",
                inner.name
            )));
        }
        let deferred = Deferred {
            init: opts.init.or_else(|| inner.init.clone()),
            contexts,
            default_init: opts
                .default_init
                .unwrap_or_else(|| Arc::new(Uniform::default())),
            data: None,
        };

        if !inner.can_materialize() {
            if !inner.allow_deferred_init {
                return Err(Error::invalid_shape(
                    &inner.name,
                    format!(
                        "cannot initialize parameter with invalid shape {}; declare the full shape or allow deferred initialization",
                        inner.shape_str()
                    ),
                ));
            }
            debug!(
                param = %inner.name,
                shape = %inner.shape_str(),
                "deferring initialization until the shape is known"
            );
            inner.state = State::Deferred(deferred);
            return Ok(());
        }

        let previous = std::mem::replace(&mut inner.state, State::Deferred(deferred));
        if let Err(e) = inner.materialize() {
            inner.state = previous;
            return Err(e);
        }
        if let State::Materialized(old) = previous {
            autograd::unmark_variables(&old.data);
        }
        Ok(())
    }

    /// Materialize a deferred parameter now that its shape is known.
    ///
    /// Does nothing if the parameter is not in the deferred state.
    pub fn finish_deferred_init(&self) -> Result<()> {
        self.inner.write().materialize()
    }

    /// Data replica on `context`. With `None`, a lone replica is returned
    /// directly; otherwise the ambient context picks the replica.
    pub fn data(&self, context: Option<Context>) -> Result<NDArray> {
        self.inner.read().get(context, Slot::Data)
    }

    /// Gradient replica on `context`, with the same lookup as [`data`].
    ///
    /// [`data`]: Parameter::data
    pub fn grad(&self, context: Option<Context>) -> Result<NDArray> {
        self.inner.read().get(context, Slot::Grad)
    }

    /// All data replicas, in context order.
    pub fn list_data(&self) -> Result<Vec<NDArray>> {
        Ok(self.inner.read().replicas()?.data.clone())
    }

    /// All gradient replicas, in context order.
    pub fn list_grad(&self) -> Result<Vec<NDArray>> {
        let inner = self.inner.read();
        let r = inner.replicas()?;
        r.grad.clone().ok_or_else(|| Error::NullGradient {
            name: inner.name.clone(),
        })
    }

    /// Contexts this parameter lives on, or will live on once a deferred
    /// initialization completes.
    pub fn list_ctx(&self) -> Result<Vec<Context>> {
        let inner = self.inner.read();
        match &inner.state {
            State::Materialized(r) => Ok(r.contexts.clone()),
            State::Deferred(d) => Ok(d.contexts.clone()),
            State::Uninitialized => Err(Error::Uninitialized {
                name: inner.name.clone(),
            }),
        }
    }

    /// `(data, grad)` pairs per context. Empty when grad_req is `null`.
    pub fn grad_replicas(&self) -> Result<Vec<(NDArray, NDArray)>> {
        let inner = self.inner.read();
        let r = inner.replicas()?;
        Ok(match &r.grad {
            Some(grads) => r.data.iter().cloned().zip(grads.iter().cloned()).collect(),
            None => Vec::new(),
        })
    }

    /// Change how backward writes gradients. Switching to `null` drops the
    /// gradient replicas; switching away from it allocates zeroed ones.
    /// Non-differentiable parameters stay at `null`.
    pub fn set_grad_req(&self, req: GradReq) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let req = if inner.differentiable { req } else { GradReq::Null };
        if inner.grad_req == req {
            return Ok(());
        }
        inner.grad_req = req;
        if let State::Materialized(r) = &mut inner.state {
            let _pause = RecordingScope::pause(false);
            init_grad(r, req)?;
        }
        Ok(())
    }

    /// Set every gradient replica to zero in place.
    pub fn zero_grad(&self) {
        let inner = self.inner.read();
        if let State::Materialized(Replicas {
            grad: Some(grads), ..
        }) = &inner.state
        {
            for g in grads {
                g.fill(0.0);
            }
        }
    }

    /// Overwrite the values on every context. On a deferred parameter the
    /// data is kept and used in place of the initializer.
    pub fn set_data(&self, data: &NDArray) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let uninitialized = Error::Uninitialized {
            name: inner.name.clone(),
        };
        if matches!(inner.state, State::Uninitialized) {
            return Err(uninitialized);
        }
        inner.set_shape(data.shape().clone())?;
        match &mut inner.state {
            State::Deferred(d) => {
                d.data = Some(data.clone());
                Ok(())
            }
            State::Materialized(r) => {
                for replica in &r.data {
                    replica.copy_from(data)?;
                }
                Ok(())
            }
            State::Uninitialized => Err(uninitialized),
        }
    }

    /// Convert data and gradients to `dtype`.
    pub fn cast(&self, dtype: DType) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if let State::Materialized(r) = &mut inner.state {
            let _pause = RecordingScope::pause(false);
            let data = r
                .data
                .iter()
                .map(|d| d.astype(dtype))
                .collect::<Result<Vec<_>>>()?;
            let grad = match &r.grad {
                Some(grads) => Some(
                    grads
                        .iter()
                        .map(|g| g.astype(dtype))
                        .collect::<Result<Vec<_>>>()?,
                ),
                None => None,
            };
            autograd::unmark_variables(&r.data);
            if let Some(grads) = &grad {
                autograd::mark_variables(&data, grads, &vec![inner.grad_req; grads.len()])?;
            }
            r.data = data;
            r.grad = grad;
        }
        inner.dtype = dtype;
        Ok(())
    }

    /// Move to a new set of contexts, keeping the current values (averaged
    /// over the old replicas).
    pub fn reset_ctx(&self, contexts: &[Context]) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if let State::Deferred(d) = &mut inner.state {
            if contexts.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "parameter '{}' needs at least one context",
                    inner.name
                )));
            }
            d.contexts = contexts.to_vec();
            return Ok(());
        }
        let data = inner.reduce()?;
        let _pause = RecordingScope::pause(false);
        inner.init_impl(data, contexts)?;
        debug!(param = %inner.name, contexts = %format_contexts(contexts), "reset parameter contexts");
        Ok(())
    }

    /// Mean of the data replicas, on cpu(0).
    pub fn reduce(&self) -> Result<NDArray> {
        self.inner.read().reduce()
    }

    /// Validate that `data` could be loaded into this parameter.
    pub(crate) fn check_loadable(&self, data: &NDArray, contexts: Option<&[Context]>) -> Result<()> {
        self.inner.read().check_loadable(data, contexts)
    }

    /// Load saved values, materializing the parameter if needed.
    pub(crate) fn load_init(&self, data: &NDArray, contexts: Option<&[Context]>) -> Result<()> {
        self.inner.write().load_init(data, contexts)
    }

    /// Check requested attributes against the stored ones, then merge the
    /// shape and fill a missing initializer. Nothing changes on conflict.
    pub(crate) fn merge_attrs(&self, attrs: &ParamAttrs) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let name = inner.name.clone();
        let conflict = |attribute: &str, existing: String, requested: String| Error::NameConflict {
            name: name.clone(),
            attribute: attribute.to_string(),
            existing,
            requested,
        };

        let shape = match (&inner.shape, &attrs.shape) {
            (Some(old), Some(new)) => Some(
                old.merge(new)
                    .ok_or_else(|| conflict("shape", old.to_string(), new.to_string()))?,
            ),
            (None, Some(new)) => Some(new.clone()),
            (old, None) => old.clone(),
        };
        if let Some(dtype) = attrs.dtype {
            if dtype != inner.dtype {
                return Err(conflict("dtype", inner.dtype.to_string(), dtype.to_string()));
            }
        }
        if let Some(req) = attrs.grad_req {
            if req != inner.grad_req {
                return Err(conflict("grad_req", inner.grad_req.to_string(), req.to_string()));
            }
        }
        if let Some(lr_mult) = attrs.lr_mult {
            if lr_mult != inner.lr_mult {
                return Err(conflict("lr_mult", inner.lr_mult.to_string(), lr_mult.to_string()));
            }
        }
        if let Some(wd_mult) = attrs.wd_mult {
            if wd_mult != inner.wd_mult {
                return Err(conflict("wd_mult", inner.wd_mult.to_string(), wd_mult.to_string()));
            }
        }
        if let Some(allow) = attrs.allow_deferred_init {
            if allow != inner.allow_deferred_init {
                return Err(conflict(
                    "allow_deferred_init",
                    inner.allow_deferred_init.to_string(),
                    allow.to_string(),
                ));
            }
        }
        if let Some(differentiable) = attrs.differentiable {
            if differentiable != inner.differentiable {
                return Err(conflict(
                    "differentiable",
                    inner.differentiable.to_string(),
                    differentiable.to_string(),
                ));
            }
        }
        if let (Some(old), Some(new)) = (&inner.init, &attrs.init) {
            let (old_repr, new_repr) = (format!("{old:?}"), format!("{new:?}"));
            if !Arc::ptr_eq(old, new) && old_repr != new_repr {
                return Err(conflict("init", old_repr, new_repr));
            }
        }

        inner.shape = shape;
        if inner.init.is_none() {
            inner.init = attrs.init.clone();
        }
        Ok(())
    }

    /// Symbolic placeholder for this parameter.
    pub fn var(&self) -> Symbol {
        let inner = self.inner.read();
        let sym = Symbol::var(inner.name.as_str()).with_dtype(inner.dtype);
        match &inner.shape {
            Some(shape) => sym.with_shape(shape.clone()),
            None => sym,
        }
    }
}

impl PartialEq for Parameter {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Parameter {}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        write!(
            f,
            "Parameter {} (shape={}, dtype={})",
            inner.name,
            inner.shape_str(),
            inner.dtype
        )
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:?}]", self, self.state())
    }
}
