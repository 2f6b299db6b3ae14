// ParameterDict — Ordered, prefixed registry of parameters
//
// Every block owns a ParameterDict whose prefix is the block's prefix. Names
// passed to `get` are relative; the stored key is always `prefix + name`.
//
// SHARING:
//
// A dict may be created with a `shared` dict. Lookups that miss locally
// fall through to the shared dict. A hit there is cached locally, so both
// dicts then hand out the identical Parameter. This is how two blocks end
// up training the same weights.
//
// `get` is idempotent: asking again for an existing name returns the same
// Parameter after checking that the requested attributes agree with the
// stored ones (unknown shape dimensions are merged, anything else must
// match exactly).
//
// PERSISTENCE:
//
// `save` writes each parameter's replica mean under its name (optionally
// with a prefix stripped) to a safetensors file. `load` validates the
// whole file against the dict before touching any parameter.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use gluon_core::safetensors;
use gluon_core::{Context, DType, Error, GradReq, NDArray, Result};

use crate::parameter::{InitOptions, ParamAttrs, Parameter};

/// Options for [`ParameterDict::load`] and `Block::load_params`.
#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    /// Contexts to materialize uninitialized parameters on (default cpu(0)).
    pub contexts: Option<Vec<Context>>,
    /// Do not fail when a parameter is absent from the file.
    pub allow_missing: bool,
    /// Do not fail when the file holds names the dict does not know.
    pub ignore_extra: bool,
    /// Prepended to every name read from the file.
    pub restore_prefix: String,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contexts(mut self, contexts: impl Into<Vec<Context>>) -> Self {
        self.contexts = Some(contexts.into());
        self
    }

    pub fn with_allow_missing(mut self, allow: bool) -> Self {
        self.allow_missing = allow;
        self
    }

    pub fn with_ignore_extra(mut self, ignore: bool) -> Self {
        self.ignore_extra = ignore;
        self
    }

    pub fn with_restore_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.restore_prefix = prefix.into();
        self
    }
}

/// Strip the `arg:` / `aux:` tags some checkpoints put on their keys.
pub(crate) fn strip_storage_tag(key: &str) -> &str {
    key.strip_prefix("arg:")
        .or_else(|| key.strip_prefix("aux:"))
        .unwrap_or(key)
}

struct DictInner {
    prefix: String,
    params: Vec<(String, Parameter)>,
    index: HashMap<String, usize>,
    shared: Option<ParameterDict>,
}

impl DictInner {
    fn get(&self, name: &str) -> Option<Parameter> {
        self.index.get(name).map(|&i| self.params[i].1.clone())
    }

    fn insert(&mut self, name: String, param: Parameter) {
        match self.index.get(&name) {
            Some(&i) => self.params[i].1 = param,
            None => {
                self.index.insert(name.clone(), self.params.len());
                self.params.push((name, param));
            }
        }
    }
}

/// Handle to a prefixed parameter registry. Clones share the registry.
#[derive(Clone)]
pub struct ParameterDict {
    inner: Arc<RwLock<DictInner>>,
}

impl Default for ParameterDict {
    fn default() -> Self {
        ParameterDict::new("")
    }
}

impl ParameterDict {
    pub fn new(prefix: impl Into<String>) -> Self {
        ParameterDict::with_shared(prefix, None)
    }

    pub fn with_shared(prefix: impl Into<String>, shared: Option<ParameterDict>) -> Self {
        ParameterDict {
            inner: Arc::new(RwLock::new(DictInner {
                prefix: prefix.into(),
                params: Vec::new(),
                index: HashMap::new(),
                shared,
            })),
        }
    }

    pub fn prefix(&self) -> String {
        self.inner.read().prefix.clone()
    }

    pub fn shared(&self) -> Option<ParameterDict> {
        self.inner.read().shared.clone()
    }

    pub fn ptr_eq(&self, other: &ParameterDict) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn len(&self) -> usize {
        self.inner.read().params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a parameter with this full name is stored locally.
    pub fn contains(&self, full_name: &str) -> bool {
        self.inner.read().index.contains_key(full_name)
    }

    /// Local lookup by full name.
    pub fn param(&self, full_name: &str) -> Option<Parameter> {
        self.inner.read().get(full_name)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner
            .read()
            .params
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn values(&self) -> Vec<Parameter> {
        self.inner
            .read()
            .params
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// `(full name, parameter)` pairs in insertion order.
    pub fn items(&self) -> Vec<(String, Parameter)> {
        self.inner.read().params.clone()
    }

    /// Iterate over a snapshot of [`items`](Self::items).
    pub fn iter(&self) -> impl Iterator<Item = (String, Parameter)> {
        self.items().into_iter()
    }

    /// Local lookup, then the shared dict (caching a hit locally).
    fn lookup(&self, full_name: &str) -> Option<Parameter> {
        let shared = {
            let inner = self.inner.read();
            if let Some(p) = inner.get(full_name) {
                return Some(p);
            }
            inner.shared.clone()
        };
        let found = shared?.param(full_name)?;
        self.inner
            .write()
            .insert(full_name.to_string(), found.clone());
        Some(found)
    }

    /// Retrieve `prefix + name`, creating it with `attrs` if absent.
    ///
    /// When the parameter already exists, every attribute given in `attrs`
    /// is checked against it; a disagreement is a `NameConflict` and leaves
    /// the parameter untouched.
    pub fn get(&self, name: &str, attrs: ParamAttrs) -> Result<Parameter> {
        let full = format!("{}{name}", self.prefix());
        if let Some(param) = self.lookup(&full) {
            param.merge_attrs(&attrs)?;
            return Ok(param);
        }
        let param = Parameter::new(full.clone(), attrs);
        self.inner.write().insert(full, param.clone());
        Ok(param)
    }

    /// Retrieve or create a constant. `value` is required to create one.
    pub fn get_constant(&self, name: &str, value: Option<NDArray>) -> Result<Parameter> {
        let full = format!("{}{name}", self.prefix());
        if let Some(param) = self.lookup(&full) {
            if param.differentiable() {
                return Err(Error::NameConflict {
                    name: full,
                    attribute: "kind".into(),
                    existing: "Parameter".into(),
                    requested: "Constant".into(),
                });
            }
            if let Some(value) = &value {
                if param.shape().as_ref() != Some(value.shape()) {
                    return Err(Error::NameConflict {
                        name: full,
                        attribute: "shape".into(),
                        existing: param
                            .shape()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "None".into()),
                        requested: value.shape().to_string(),
                    });
                }
            }
            return Ok(param);
        }
        let value = value.ok_or_else(|| {
            Error::InvalidArgument(format!(
                "no constant named '{full}'; pass a value to create it"
            ))
        })?;
        let param = Parameter::constant(full.clone(), value);
        self.inner.write().insert(full, param.clone());
        Ok(param)
    }

    /// Merge another dict into this one.
    pub fn update(&self, other: &ParameterDict) -> Result<()> {
        if self.ptr_eq(other) {
            return Ok(());
        }
        self.extend(other.items())
    }

    /// Insert `(full name, parameter)` pairs. A name already bound to a
    /// different Parameter is a `NameConflict`. All pairs are checked
    /// before any is inserted.
    pub fn extend(&self, items: impl IntoIterator<Item = (String, Parameter)>) -> Result<()> {
        let items: Vec<_> = items.into_iter().collect();
        let mut inner = self.inner.write();
        for (name, param) in &items {
            if let Some(existing) = inner.get(name) {
                if !existing.ptr_eq(param) {
                    return Err(Error::NameConflict {
                        name: name.clone(),
                        attribute: "identity".into(),
                        existing: existing.to_string(),
                        requested: param.to_string(),
                    });
                }
            }
        }
        for (name, param) in items {
            inner.insert(name, param);
        }
        Ok(())
    }

    /// Initialize every parameter.
    ///
    /// `opts.init` (or `opts.default_init`) acts as the default: parameters
    /// that declare their own initializer keep using it.
    pub fn init(&self, opts: InitOptions) -> Result<()> {
        let default_init = opts.init.or(opts.default_init);
        let params = self.values();
        debug!(prefix = %self.prefix(), count = params.len(), "initializing parameters");
        for param in params {
            param.init(InitOptions {
                init: None,
                contexts: opts.contexts.clone(),
                default_init: default_init.clone(),
                force_reinit: opts.force_reinit,
            })?;
        }
        Ok(())
    }

    pub fn zero_grad(&self) {
        for param in self.values() {
            param.zero_grad();
        }
    }

    pub fn reset_ctx(&self, contexts: &[Context]) -> Result<()> {
        for param in self.values() {
            param.reset_ctx(contexts)?;
        }
        Ok(())
    }

    pub fn set_grad_req(&self, req: GradReq) -> Result<()> {
        for param in self.values() {
            param.set_grad_req(req)?;
        }
        Ok(())
    }

    pub fn set_lr_mult(&self, lr_mult: f64) {
        for param in self.values() {
            param.set_lr_mult(lr_mult);
        }
    }

    pub fn set_wd_mult(&self, wd_mult: f64) {
        for param in self.values() {
            param.set_wd_mult(wd_mult);
        }
    }

    pub fn cast(&self, dtype: DType) -> Result<()> {
        for param in self.values() {
            param.cast(dtype)?;
        }
        Ok(())
    }

    /// Union of the contexts of every parameter, sorted.
    pub fn list_ctx(&self) -> Result<Vec<Context>> {
        let mut contexts = Vec::new();
        for param in self.values() {
            contexts.extend(param.list_ctx()?);
        }
        contexts.sort();
        contexts.dedup();
        Ok(contexts)
    }

    /// Write every parameter to `path`, with `strip_prefix` removed from
    /// the front of each name.
    pub fn save(&self, path: impl AsRef<Path>, strip_prefix: &str) -> Result<()> {
        let path = path.as_ref();
        let mut tensors = Vec::with_capacity(self.len());
        for (name, param) in self.items() {
            let stripped = name.strip_prefix(strip_prefix).ok_or_else(|| {
                Error::Persistence(format!(
                    "prefix '{strip_prefix}' is to be stripped before saving, but parameter name '{name}' does not start with it"
                ))
            })?;
            tensors.push((stripped.to_string(), param.reduce()?));
        }
        safetensors::save(path, &tensors)?;
        debug!(file = %path.display(), count = tensors.len(), "saved parameters");
        Ok(())
    }

    /// Load parameters from `path`.
    ///
    /// Names in the file get `restore_prefix` prepended (after any `arg:` /
    /// `aux:` tag is dropped). Missing names are checked first, then extra
    /// names, then each parameter's shape/dtype/contexts; values are only
    /// written once everything has passed.
    pub fn load(&self, path: impl AsRef<Path>, opts: &LoadOptions) -> Result<()> {
        let path = path.as_ref();
        let prefix = opts.restore_prefix.as_str();
        let keys = self.keys();
        if !prefix.is_empty() {
            if let Some(name) = keys.iter().find(|k| !k.starts_with(prefix)) {
                return Err(Error::Persistence(format!(
                    "restore_prefix is '{prefix}' but parameter name '{name}' does not start with it"
                )));
            }
        }

        let loaded: Vec<(String, NDArray)> = safetensors::load(path, Context::cpu(0))?
            .into_iter()
            .map(|(k, v)| (format!("{prefix}{}", strip_storage_tag(&k)), v))
            .collect();
        let loaded_names: Vec<&str> = loaded.iter().map(|(k, _)| k.as_str()).collect();

        if !opts.allow_missing {
            if let Some(name) = keys.iter().find(|k| !loaded_names.contains(&k.as_str())) {
                return Err(Error::Persistence(format!(
                    "parameter '{name}' is missing in file '{}', which contains parameters: [{}]; set allow_missing to ignore missing parameters",
                    path.display(),
                    loaded_names.join(", ")
                )));
            }
        }

        let contexts = opts.contexts.as_deref();
        let mut targets = Vec::with_capacity(loaded.len());
        for (name, data) in &loaded {
            match self.param(name) {
                Some(param) => {
                    param.check_loadable(data, contexts)?;
                    targets.push((param, data));
                }
                None if opts.ignore_extra => {}
                None => {
                    return Err(Error::Persistence(format!(
                        "parameter '{name}' loaded from file '{}' is not present in this ParameterDict, which contains parameters [{}]; set ignore_extra to ignore",
                        path.display(),
                        keys.join(", ")
                    )))
                }
            }
        }

        for (param, data) in &targets {
            param.load_init(data, contexts)?;
        }
        debug!(file = %path.display(), count = targets.len(), "loaded parameters");
        Ok(())
    }
}

impl fmt::Display for ParameterDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ParameterDict (")?;
        for param in self.values() {
            writeln!(f, "  {param}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for ParameterDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterDict")
            .field("prefix", &self.prefix())
            .field("keys", &self.keys())
            .finish()
    }
}
