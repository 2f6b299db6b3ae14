// HybridBlock — Blocks that run on concrete arrays or on symbols
//
// A hybrid block describes its computation once and can be driven two ways:
//
//   HybridInput::Array(x)   → resolve own parameters on x's context, then
//                             hybrid_forward(x, params)
//   HybridInput::Symbol(s)  → infer_shape(s): propagate shapes through the
//                             block, fixing the shapes of its parameters
//
// DEFERRED INITIALIZATION:
//
// Layers like Dense can be declared without knowing their input width. The
// first concrete forward finds a parameter still deferred, runs
// infer_shape on a symbol describing the input, finishes every deferred
// parameter of the block, and resolves again. That retry happens at most
// once per call; a second failure is returned to the caller.

use tracing::debug;

use gluon_core::{Error, NDArray, Result};

use crate::block::{Block, BlockCore};
use crate::symbol::Symbol;

/// Parameter arrays resolved for one forward call, by attribute name.
#[derive(Debug, Clone, Default)]
pub struct ParamData {
    values: Vec<(String, NDArray)>,
}

impl ParamData {
    pub fn get(&self, name: &str) -> Result<&NDArray> {
        self.maybe(name)
            .ok_or_else(|| Error::msg(format!("no parameter named '{name}' was resolved for this block")))
    }

    pub fn maybe(&self, name: &str) -> Option<&NDArray> {
        self.values.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Input to [`call`].
#[derive(Debug, Clone, Copy)]
pub enum HybridInput<'a> {
    Array(&'a NDArray),
    Symbol(&'a Symbol),
}

impl<'a> From<&'a NDArray> for HybridInput<'a> {
    fn from(x: &'a NDArray) -> Self {
        HybridInput::Array(x)
    }
}

impl<'a> From<&'a Symbol> for HybridInput<'a> {
    fn from(s: &'a Symbol) -> Self {
        HybridInput::Symbol(s)
    }
}

/// Output of [`call`], matching the kind of input.
#[derive(Debug, Clone)]
pub enum HybridOutput {
    Array(NDArray),
    Symbol(Symbol),
}

impl HybridOutput {
    pub fn into_array(self) -> Result<NDArray> {
        match self {
            HybridOutput::Array(a) => Ok(a),
            HybridOutput::Symbol(s) => Err(Error::msg(format!("expected an array output, got {s}"))),
        }
    }

    pub fn into_symbol(self) -> Result<Symbol> {
        match self {
            HybridOutput::Symbol(s) => Ok(s),
            HybridOutput::Array(_) => Err(Error::msg("expected a symbol output, got an array")),
        }
    }
}

/// A block whose computation can be traced symbolically.
pub trait HybridBlock: Block {
    /// Propagate `x` through this block: fix the shapes of this block's
    /// (and its children's) parameters and return the output symbol.
    fn infer_shape(&self, x: &Symbol) -> Result<Symbol>;

    /// The computation on concrete arrays, with this block's registered
    /// parameters already resolved on `x`'s context.
    fn hybrid_forward(&self, x: &NDArray, params: &ParamData) -> Result<NDArray>;
}

/// Resolve the block's registered parameters on `x`'s context.
fn resolve_params(core: &BlockCore, x: &NDArray) -> Result<ParamData> {
    let context = x.context();
    let values = core
        .reg_params()
        .iter()
        .map(|(name, param)| Ok((name.clone(), param.data(Some(context))?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(ParamData { values })
}

/// Concrete forward with one-time deferred shape inference.
pub fn forward<B: HybridBlock + ?Sized>(block: &B, x: &NDArray) -> Result<NDArray> {
    let params = match resolve_params(block.core(), x) {
        Err(Error::DeferredInit { name }) => {
            debug!(block = %block.name(), param = %name, "inferring deferred parameter shapes");
            block.infer_shape(&Symbol::from_array("data", x))?;
            for param in block.params().values() {
                param.finish_deferred_init()?;
            }
            resolve_params(block.core(), x)?
        }
        other => other?,
    };
    block.hybrid_forward(x, &params)
}

/// Dispatch on the kind of input.
pub fn call<'a, B: HybridBlock + ?Sized>(block: &B, input: impl Into<HybridInput<'a>>) -> Result<HybridOutput> {
    match input.into() {
        HybridInput::Array(x) => forward(block, x).map(HybridOutput::Array),
        HybridInput::Symbol(s) => {
            let _scope = block.name_scope();
            block.infer_shape(s).map(HybridOutput::Symbol)
        }
    }
}

/// View `block` as a hybrid block, or fail the way a hybrid container must
/// when handed an ordinary block.
pub fn require_hybrid<'b>(block: &'b dyn Block, container: &str) -> Result<&'b dyn HybridBlock> {
    block.as_hybrid().ok_or_else(|| {
        Error::InvalidArgument(format!(
            "children of {container} must be hybrid blocks, but '{}' is not; use Sequential for ordinary blocks",
            block.name()
        ))
    })
}
