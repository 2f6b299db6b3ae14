// Sequential — Blocks applied one after another
//
// The output of each child becomes the input of the next. Children are
// registered under their position ("0", "1", ...), which is also their
// structural name when saving with `save_params`.
//
//   let mut net = Sequential::new();
//   {
//       let _scope = net.name_scope();
//       net.add(Dense::new(64, DenseConfig::default().with_activation(ActivationKind::Relu))?)?;
//       net.add(Dense::new(10, DenseConfig::default())?)?;
//   }
//   net.initialize(InitOptions::new())?;
//   let out = net.forward(&x)?;
//
// HybridSequential is the same chain restricted to hybrid children, so the
// whole chain can also be fed a Symbol for shape inference.

use gluon_core::{NDArray, Result};

use crate::block::{Block, BlockCore, ChildRef};
use crate::hybrid::{self, HybridBlock, ParamData};
use crate::parameter_dict::ParameterDict;
use crate::symbol::Symbol;

fn describe_chain(title: &str, core: &BlockCore) -> String {
    let mut s = format!("{title}(\n");
    for (name, child) in core.children() {
        let body = child.describe().replace('\n', "\n  ");
        s.push_str(&format!("  ({name}): {body}\n"));
    }
    s.push(')');
    s
}

/// A container that chains blocks.
pub struct Sequential {
    core: BlockCore,
}

impl Sequential {
    pub fn new() -> Self {
        Self::with_prefix(None, None)
    }

    pub fn with_prefix(prefix: Option<&str>, params: Option<&ParameterDict>) -> Self {
        Sequential {
            core: BlockCore::new(prefix, params, "sequential"),
        }
    }

    /// Append a block to the chain.
    pub fn add(&mut self, block: impl Block + 'static) -> Result<ChildRef> {
        self.core.register_child(None, block)
    }

    pub fn len(&self) -> usize {
        self.core.num_children()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Sequential {
    fn default() -> Self {
        Self::new()
    }
}

impl Block for Sequential {
    fn core(&self) -> &BlockCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BlockCore {
        &mut self.core
    }

    fn forward(&self, x: &NDArray) -> Result<NDArray> {
        let mut out = x.clone();
        for (_, child) in self.core.children() {
            out = child.forward(&out)?;
        }
        Ok(out)
    }

    fn describe(&self) -> String {
        describe_chain("Sequential", &self.core)
    }
}

/// A chain of hybrid blocks.
pub struct HybridSequential {
    core: BlockCore,
}

impl HybridSequential {
    pub fn new() -> Self {
        Self::with_prefix(None, None)
    }

    pub fn with_prefix(prefix: Option<&str>, params: Option<&ParameterDict>) -> Self {
        HybridSequential {
            core: BlockCore::new(prefix, params, "hybridsequential"),
        }
    }

    /// Append a block. Fails unless the block is hybrid.
    pub fn add(&mut self, block: impl Block + 'static) -> Result<ChildRef> {
        self.core.register_hybrid_child(None, block)
    }

    pub fn len(&self) -> usize {
        self.core.num_children()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HybridSequential {
    fn default() -> Self {
        Self::new()
    }
}

impl Block for HybridSequential {
    fn core(&self) -> &BlockCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BlockCore {
        &mut self.core
    }

    fn forward(&self, x: &NDArray) -> Result<NDArray> {
        hybrid::forward(self, x)
    }

    fn as_hybrid(&self) -> Option<&dyn HybridBlock> {
        Some(self)
    }

    fn describe(&self) -> String {
        describe_chain("HybridSequential", &self.core)
    }
}

impl HybridBlock for HybridSequential {
    fn infer_shape(&self, x: &Symbol) -> Result<Symbol> {
        let mut out = x.clone();
        for (_, child) in self.core.children() {
            out = hybrid::require_hybrid(child, "HybridSequential")?.infer_shape(&out)?;
        }
        Ok(out)
    }

    fn hybrid_forward(&self, x: &NDArray, _params: &ParamData) -> Result<NDArray> {
        let mut out = x.clone();
        for (_, child) in self.core.children() {
            out = child.forward(&out)?;
        }
        Ok(out)
    }
}
