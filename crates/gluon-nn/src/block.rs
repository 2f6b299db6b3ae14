// Block — The interface every layer and container implements
//
// A Block owns a prefix, a ParameterDict with that prefix, an ordered list
// of child blocks and an ordered list of registered parameters. The
// `forward()` method computes the output; everything else (collecting
// parameters, initialization, persistence) is provided on top of the
// shared `BlockCore`.
//
// NAMING:
//
// Blocks constructed outside any block scope get their prefix from the
// current NameManager (`dense0_`, `dense1_`, ...). Blocks constructed
// inside a parent's `name_scope()` get a prefix local to that parent
// (`hint + per-parent counter + "_"`) appended to the parent's prefix, so
// the same network definition always yields the same names:
//
//   let mut net = Sequential::new();                           // sequential0_
//   {
//       let _scope = net.name_scope();
//       net.add(Dense::new(10, DenseConfig::default())?)?;      // sequential0_dense0_
//       net.add(Dense::new(10, DenseConfig::default())?)?;      // sequential0_dense1_
//   }
//
// Scope guards restore the previous block scope and name manager when
// dropped, including while unwinding from a panic.
//
// CHILDREN AND PARAMETERS:
//
// `register_child` and `register_parameter` return small typed handles
// (ChildRef / ParamRef) that the owning layer keeps and resolves through
// its core. Registration order is traversal order.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use regex::Regex;
use tracing::debug;

use gluon_core::safetensors;
use gluon_core::{Context, DType, Error, NDArray, NameManager, NameScope, Result};

use crate::hybrid::HybridBlock;
use crate::parameter::{InitOptions, Parameter};
use crate::parameter_dict::{strip_storage_tag, LoadOptions, ParameterDict};

// Block scope stack

struct ScopeFrame {
    prefix: String,
    params: ParameterDict,
    counter: Rc<RefCell<HashMap<String, usize>>>,
}

thread_local! {
    static BLOCK_SCOPE: RefCell<Vec<ScopeFrame>> = const { RefCell::new(Vec::new()) };
}

/// Restores the enclosing block scope and name manager on drop.
#[must_use = "the block scope is exited as soon as the guard is dropped"]
pub struct BlockScopeGuard {
    depth: Option<usize>,
    _names: Option<NameScope>,
}

impl Drop for BlockScopeGuard {
    fn drop(&mut self) {
        if let Some(depth) = self.depth {
            BLOCK_SCOPE.with(|stack| stack.borrow_mut().truncate(depth));
        }
    }
}

/// Prefix of the innermost active block scope, if any.
pub fn current_scope_prefix() -> Option<String> {
    BLOCK_SCOPE.with(|stack| stack.borrow().last().map(|f| f.prefix.clone()))
}

/// Compute the prefix and parameter dict for a block being created now.
fn make_prefix_and_params(
    prefix: Option<&str>,
    params: Option<&ParameterDict>,
    hint: &str,
) -> (String, ParameterDict) {
    BLOCK_SCOPE.with(|stack| {
        let stack = stack.borrow();
        match stack.last() {
            None => {
                let prefix = match prefix {
                    Some(p) => p.to_string(),
                    None => format!("{}_", NameManager::current().get(None, hint)),
                };
                let params = match params {
                    Some(shared) => ParameterDict::with_shared(shared.prefix(), Some(shared.clone())),
                    None => ParameterDict::new(prefix.clone()),
                };
                (prefix, params)
            }
            Some(frame) => {
                let local = match prefix {
                    Some(p) => p.to_string(),
                    None => {
                        let mut counter = frame.counter.borrow_mut();
                        let count = counter.entry(hint.to_string()).or_insert(0);
                        let local = format!("{hint}{count}_");
                        *count += 1;
                        local
                    }
                };
                let params = match params {
                    Some(shared) => ParameterDict::with_shared(shared.prefix(), Some(shared.clone())),
                    None => ParameterDict::with_shared(
                        format!("{}{local}", frame.params.prefix()),
                        frame.params.shared(),
                    ),
                };
                (format!("{}{local}", frame.prefix), params)
            }
        }
    })
}

/// Handle to a child registered on a [`BlockCore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildRef(usize);

/// Handle to a parameter registered on a [`BlockCore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamRef(usize);

/// State shared by every block.
pub struct BlockCore {
    prefix: String,
    name: String,
    params: ParameterDict,
    children: Vec<(String, Box<dyn Block>)>,
    reg_params: Vec<(String, Parameter)>,
    counter: Rc<RefCell<HashMap<String, usize>>>,
}

impl BlockCore {
    /// `prefix` overrides the generated prefix; `params` makes this block
    /// share parameters with another dict; `hint` seeds generated names.
    pub fn new(prefix: Option<&str>, params: Option<&ParameterDict>, hint: &str) -> Self {
        let (prefix, params) = make_prefix_and_params(prefix, params, hint);
        let name = prefix.strip_suffix('_').unwrap_or(&prefix).to_string();
        BlockCore {
            prefix,
            name,
            params,
            children: Vec::new(),
            reg_params: Vec::new(),
            counter: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &ParameterDict {
        &self.params
    }

    /// Enter this block's scope: children created while the guard lives
    /// are prefixed with this block's prefix. A block with an empty prefix
    /// does not open a scope.
    pub fn name_scope(&self) -> BlockScopeGuard {
        if self.prefix.is_empty() {
            return BlockScopeGuard {
                depth: None,
                _names: None,
            };
        }
        let depth = BLOCK_SCOPE.with(|stack| {
            let mut stack = stack.borrow_mut();
            let depth = stack.len();
            stack.push(ScopeFrame {
                prefix: self.prefix.clone(),
                params: self.params.clone(),
                counter: Rc::clone(&self.counter),
            });
            depth
        });
        let names = Rc::new(NameManager::with_prefix(self.prefix.clone())).enter();
        BlockScopeGuard {
            depth: Some(depth),
            _names: Some(names),
        }
    }

    /// Register a child block. `name` defaults to the number of children
    /// registered so far. Re-registering a name replaces that child.
    pub fn register_child(&mut self, name: Option<&str>, child: impl Block + 'static) -> Result<ChildRef> {
        self.register_boxed_child(name, Box::new(child))
    }

    pub fn register_boxed_child(&mut self, name: Option<&str>, child: Box<dyn Block>) -> Result<ChildRef> {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| self.children.len().to_string());
        if self.reg_params.iter().any(|(k, _)| *k == name) {
            return Err(Error::NameConflict {
                name: format!("{}{name}", self.prefix),
                attribute: "attribute type".into(),
                existing: "Parameter".into(),
                requested: "Block".into(),
            });
        }
        if let Some(i) = self.children.iter().position(|(k, _)| *k == name) {
            self.children[i].1 = child;
            return Ok(ChildRef(i));
        }
        self.children.push((name, child));
        Ok(ChildRef(self.children.len() - 1))
    }

    /// Register a child of a hybrid block. Fails unless `child` is hybrid
    /// too, so a hybrid parent can always trace its children.
    pub fn register_hybrid_child(&mut self, name: Option<&str>, child: impl Block + 'static) -> Result<ChildRef> {
        crate::hybrid::require_hybrid(&child, &format!("hybrid block '{}'", self.name()))?;
        self.register_boxed_child(name, Box::new(child))
    }

    /// Register a parameter under an attribute name. Names are unique
    /// across parameters and children.
    pub fn register_parameter(&mut self, name: &str, param: Parameter) -> Result<ParamRef> {
        if let Some((_, existing)) = self.reg_params.iter().find(|(k, _)| k == name) {
            return Err(Error::NameConflict {
                name: format!("{}{name}", self.prefix),
                attribute: "parameter attribute".into(),
                existing: existing.name(),
                requested: param.name(),
            });
        }
        if self.children.iter().any(|(k, _)| k == name) {
            return Err(Error::NameConflict {
                name: format!("{}{name}", self.prefix),
                attribute: "attribute type".into(),
                existing: "Block".into(),
                requested: "Parameter".into(),
            });
        }
        self.reg_params.push((name.to_string(), param));
        Ok(ParamRef(self.reg_params.len() - 1))
    }

    /// # Panics
    /// If `child` was issued by a different block.
    pub fn child(&self, child: ChildRef) -> &dyn Block {
        self.children[child.0].1.as_ref()
    }

    /// # Panics
    /// If `child` was issued by a different block.
    pub fn child_mut(&mut self, child: ChildRef) -> &mut dyn Block {
        self.children[child.0].1.as_mut()
    }

    pub fn child_by_name(&self, name: &str) -> Option<&dyn Block> {
        self.children
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, c)| c.as_ref())
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &dyn Block)> {
        self.children.iter().map(|(k, c)| (k.as_str(), c.as_ref()))
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    /// # Panics
    /// If `param` was issued by a different block.
    pub fn param(&self, param: ParamRef) -> &Parameter {
        &self.reg_params[param.0].1
    }

    pub fn param_by_name(&self, name: &str) -> Option<&Parameter> {
        self.reg_params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, p)| p)
    }

    pub fn reg_params(&self) -> &[(String, Parameter)] {
        &self.reg_params
    }
}

fn collect_into(core: &BlockCore, ret: &ParameterDict, select: Option<&Regex>) -> Result<()> {
    let own = core
        .params
        .items()
        .into_iter()
        .filter(|(name, _)| select.map_or(true, |re| re.is_match(name)));
    ret.extend(own)?;
    for (_, child) in &core.children {
        collect_into(child.core(), ret, select)?;
    }
    Ok(())
}

fn collect_params(core: &BlockCore, select: Option<&Regex>) -> Result<ParameterDict> {
    let ret = ParameterDict::new(core.prefix.clone());
    collect_into(core, &ret, select)?;
    Ok(ret)
}

fn params_with_prefix(core: &BlockCore, prefix: &str) -> Vec<(String, Parameter)> {
    let dotted = if prefix.is_empty() {
        String::new()
    } else {
        format!("{prefix}.")
    };
    let mut ret: Vec<(String, Parameter)> = core
        .reg_params
        .iter()
        .map(|(k, p)| (format!("{dotted}{k}"), p.clone()))
        .collect();
    for (name, child) in &core.children {
        ret.extend(params_with_prefix(child.core(), &format!("{dotted}{name}")));
    }
    ret
}

fn load_structural(core: &BlockCore, path: &Path, opts: &LoadOptions) -> Result<()> {
    let loaded: Vec<(String, NDArray)> = safetensors::load(path, Context::cpu(0))?
        .into_iter()
        .map(|(k, v)| (strip_storage_tag(&k).to_string(), v))
        .collect();
    let params = params_with_prefix(core, "");
    if loaded.is_empty() && params.is_empty() {
        return Ok(());
    }

    if !loaded.iter().any(|(k, _)| k.contains('.')) {
        // Flat names: a file written by ParameterDict::save with this
        // block's prefix stripped.
        let opts = LoadOptions {
            restore_prefix: core.prefix.clone(),
            ..opts.clone()
        };
        return collect_params(core, None)?.load(path, &opts);
    }

    let loaded_names: Vec<&str> = loaded.iter().map(|(k, _)| k.as_str()).collect();
    let known: Vec<&str> = params.iter().map(|(k, _)| k.as_str()).collect();
    if !opts.allow_missing {
        if let Some(name) = known.iter().find(|k| !loaded_names.contains(k)) {
            return Err(Error::Persistence(format!(
                "parameter '{name}' is missing in file '{}', which contains parameters: [{}]; set allow_missing to ignore missing parameters",
                path.display(),
                loaded_names.join(", ")
            )));
        }
    }

    let lookup: HashMap<&str, &Parameter> = params.iter().map(|(k, p)| (k.as_str(), p)).collect();
    let contexts = opts.contexts.as_deref();
    let mut targets = Vec::with_capacity(loaded.len());
    for (name, data) in &loaded {
        match lookup.get(name.as_str()) {
            Some(param) => {
                param.check_loadable(data, contexts)?;
                targets.push((*param, data));
            }
            None if opts.ignore_extra => {}
            None => {
                return Err(Error::Persistence(format!(
                    "parameter '{name}' loaded from file '{}' is not present in this block, which contains parameters [{}]; set ignore_extra to ignore",
                    path.display(),
                    known.join(", ")
                )))
            }
        }
    }
    for (param, data) in targets {
        param.load_init(data, contexts)?;
    }
    debug!(block = %core.name, file = %path.display(), "loaded block parameters");
    Ok(())
}

/// The fundamental trait for every layer and container.
///
/// Implementors provide `core()`, `core_mut()` and `forward()`; the rest is
/// derived from the core.
///
/// # Example
/// ```ignore
/// struct Scale {
///     core: BlockCore,
///     alpha: ParamRef,
/// }
///
/// impl Block for Scale {
///     fn core(&self) -> &BlockCore { &self.core }
///     fn core_mut(&mut self) -> &mut BlockCore { &mut self.core }
///     fn forward(&self, x: &NDArray) -> Result<NDArray> {
///         x.mul(&self.core.param(self.alpha).data(Some(x.context()))?)
///     }
/// }
/// ```
pub trait Block {
    fn core(&self) -> &BlockCore;

    fn core_mut(&mut self) -> &mut BlockCore;

    /// Compute the output for `x`.
    fn forward(&self, x: &NDArray) -> Result<NDArray>;

    /// This block viewed as a hybrid block. Hybrid blocks return `Some(self)`.
    fn as_hybrid(&self) -> Option<&dyn HybridBlock> {
        None
    }

    /// Short human-readable description, used when printing containers.
    fn describe(&self) -> String {
        self.core().name().to_string()
    }

    fn prefix(&self) -> &str {
        self.core().prefix()
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    /// This block's own parameter dict (without its children's).
    fn params(&self) -> &ParameterDict {
        self.core().params()
    }

    fn name_scope(&self) -> BlockScopeGuard {
        self.core().name_scope()
    }

    /// Run `f` with this block's scope entered.
    fn with_name_scope<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R
    where
        Self: Sized,
    {
        let _scope = self.name_scope();
        f(self)
    }

    /// A new dict holding this block's parameters and all descendants',
    /// keyed by full name. The Parameters themselves are shared, not copied.
    fn collect_params(&self) -> Result<ParameterDict> {
        collect_params(self.core(), None)
    }

    /// Like `collect_params`, keeping only names the regex matches.
    fn collect_params_matching(&self, pattern: &str) -> Result<ParameterDict> {
        let re = Regex::new(pattern)
            .map_err(|e| Error::InvalidArgument(format!("invalid parameter pattern '{pattern}': {e}")))?;
        collect_params(self.core(), Some(&re))
    }

    /// Parameters keyed by their structural path, e.g. `0.weight` or
    /// `encoder.1.bias`.
    fn collect_params_with_prefix(&self, prefix: &str) -> Vec<(String, Parameter)> {
        params_with_prefix(self.core(), prefix)
    }

    /// Save parameters under their structural names.
    fn save_params(&self, path: &Path) -> Result<()> {
        let tensors = self
            .collect_params_with_prefix("")
            .into_iter()
            .map(|(k, p)| Ok((k, p.reduce()?)))
            .collect::<Result<Vec<_>>>()?;
        safetensors::save(path, &tensors)?;
        debug!(block = %self.name(), file = %path.display(), count = tensors.len(), "saved block parameters");
        Ok(())
    }

    /// Load parameters saved by `save_params`. Files with flat names (no
    /// `.` anywhere) are read as a `ParameterDict::save` file whose names
    /// had this block's prefix stripped.
    fn load_params(&self, path: &Path, opts: &LoadOptions) -> Result<()> {
        load_structural(self.core(), path, opts)
    }

    /// Initialize this block's parameters and all descendants'.
    fn initialize(&self, opts: InitOptions) -> Result<()> {
        self.collect_params()?.init(opts)
    }

    fn cast(&self, dtype: DType) -> Result<()> {
        self.collect_params()?.cast(dtype)
    }

    fn zero_grad(&self) -> Result<()> {
        self.collect_params()?.zero_grad();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::ParamAttrs;
    use gluon_core::Shape;

    struct Leaf {
        core: BlockCore,
    }

    impl Leaf {
        fn new(prefix: Option<&str>, params: Option<&ParameterDict>) -> Self {
            let core = BlockCore::new(prefix, params, "leaf");
            Leaf { core }
        }
    }

    impl Block for Leaf {
        fn core(&self) -> &BlockCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut BlockCore {
            &mut self.core
        }
        fn forward(&self, x: &NDArray) -> Result<NDArray> {
            Ok(x.clone())
        }
    }

    #[test]
    fn test_scoped_prefixes() {
        let mut parent = Leaf::new(Some("net_"), None);
        {
            let _scope = parent.name_scope();
            let a = Leaf::new(None, None);
            let b = Leaf::new(None, None);
            assert_eq!(a.prefix(), "net_leaf0_");
            assert_eq!(b.prefix(), "net_leaf1_");
            assert_eq!(a.params().prefix(), "net_leaf0_");
            parent.core_mut().register_child(None, a).unwrap();
            parent.core_mut().register_child(None, b).unwrap();
        }
        assert_eq!(current_scope_prefix(), None);
        // The per-parent counter keeps going on re-entry.
        let _scope = parent.name_scope();
        assert_eq!(Leaf::new(None, None).prefix(), "net_leaf2_");
    }

    #[test]
    fn test_name_and_empty_prefix() {
        let root = Leaf::new(Some(""), None);
        assert_eq!(root.name(), "");
        {
            let _scope = root.name_scope();
            assert_eq!(current_scope_prefix(), None);
        }
        let named = Leaf::new(Some("model_"), None);
        assert_eq!(named.name(), "model");
    }

    #[test]
    fn test_scope_restored_after_panic() {
        let parent = Leaf::new(Some("outer_"), None);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = parent.name_scope();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(current_scope_prefix(), None);
    }

    #[test]
    fn test_shared_params_across_blocks() {
        let a = Leaf::new(Some("a_"), None);
        let w = a.params().get("w", ParamAttrs::new().with_shape(2)).unwrap();
        let b = Leaf::new(Some("b_"), Some(a.params()));
        assert_eq!(b.params().prefix(), "a_");
        assert_eq!(b.params().get("w", ParamAttrs::new()).unwrap(), w);
    }

    #[test]
    fn test_register_conflicts() {
        let mut blk = Leaf::new(Some("x_"), None);
        let p = blk.params().get("w", ParamAttrs::new()).unwrap();
        blk.core_mut().register_parameter("w", p.clone()).unwrap();
        assert!(matches!(
            blk.core_mut().register_parameter("w", p),
            Err(Error::NameConflict { .. })
        ));
        assert!(blk
            .core_mut()
            .register_child(Some("w"), Leaf::new(Some("y_"), None))
            .is_err());
        let c = blk
            .core_mut()
            .register_child(Some("c"), Leaf::new(Some("y_"), None))
            .unwrap();
        assert_eq!(blk.core().child(c).prefix(), "y_");
    }

    #[test]
    fn test_hybrid_parent_refuses_plain_child() {
        let mut parent = Leaf::new(Some("h_"), None);
        let err = parent
            .core_mut()
            .register_hybrid_child(Some("body"), Leaf::new(Some("plain_"), None))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(ref m) if m.contains("'h'") && m.contains("'plain'")));
        assert_eq!(parent.core().num_children(), 0);

        let dense = crate::dense::Dense::new(2, crate::dense::DenseConfig::default().with_prefix("d_")).unwrap();
        parent.core_mut().register_hybrid_child(Some("body"), dense).unwrap();
        assert_eq!(parent.core().num_children(), 1);
    }

    #[test]
    fn test_collect_params_and_select() {
        let mut parent = Leaf::new(Some("net_"), None);
        parent.params().get("scale", ParamAttrs::new().with_shape(1)).unwrap();
        {
            let _scope = parent.name_scope();
            let child = Leaf::new(None, None);
            child.params().get("weight", ParamAttrs::new().with_shape((2, 2))).unwrap();
            child.params().get("bias", ParamAttrs::new().with_shape(2)).unwrap();
            parent.core_mut().register_child(None, child).unwrap();
        }
        let all = parent.collect_params().unwrap();
        assert_eq!(all.prefix(), "net_");
        assert_eq!(
            all.keys(),
            vec!["net_scale", "net_leaf0_weight", "net_leaf0_bias"]
        );
        let again = parent.collect_params().unwrap();
        assert_eq!(all.param("net_leaf0_bias"), again.param("net_leaf0_bias"));

        let biases = parent.collect_params_matching("_bias$").unwrap();
        assert_eq!(biases.keys(), vec!["net_leaf0_bias"]);
        assert!(parent.collect_params_matching("(").is_err());

        assert_eq!(
            Some(Shape::from(2)),
            biases.param("net_leaf0_bias").unwrap().shape()
        );
    }
}
