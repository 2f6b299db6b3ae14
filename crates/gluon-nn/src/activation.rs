// Activation — Element-wise nonlinearity as a hybrid block
//
// Wraps the array-level activations (relu, sigmoid, tanh) so they can be
// composed in containers. The activation name doubles as the naming hint,
// so an Activation(relu) created at the top level is called `relu0`.

use std::fmt;
use std::str::FromStr;

use gluon_core::{Error, NDArray, Result};

use crate::block::{Block, BlockCore};
use crate::hybrid::{self, HybridBlock, ParamData};
use crate::symbol::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    Relu,
    Sigmoid,
    Tanh,
}

impl ActivationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationKind::Relu => "relu",
            ActivationKind::Sigmoid => "sigmoid",
            ActivationKind::Tanh => "tanh",
        }
    }

    pub fn apply(&self, x: &NDArray) -> Result<NDArray> {
        match self {
            ActivationKind::Relu => x.relu(),
            ActivationKind::Sigmoid => x.sigmoid(),
            ActivationKind::Tanh => x.tanh(),
        }
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "relu" => Ok(ActivationKind::Relu),
            "sigmoid" => Ok(ActivationKind::Sigmoid),
            "tanh" => Ok(ActivationKind::Tanh),
            other => Err(Error::InvalidArgument(format!(
                "unknown activation '{other}', expected one of relu, sigmoid, tanh"
            ))),
        }
    }
}

/// Applies an activation function to its input.
pub struct Activation {
    core: BlockCore,
    kind: ActivationKind,
}

impl Activation {
    pub fn new(kind: ActivationKind) -> Self {
        Self::with_prefix(kind, None)
    }

    pub fn with_prefix(kind: ActivationKind, prefix: Option<&str>) -> Self {
        Activation {
            core: BlockCore::new(prefix, None, kind.as_str()),
            kind,
        }
    }

    pub fn kind(&self) -> ActivationKind {
        self.kind
    }
}

impl Block for Activation {
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
        format!("Activation({})", self.kind)
    }
}

impl HybridBlock for Activation {
    fn infer_shape(&self, x: &Symbol) -> Result<Symbol> {
        let out = Symbol::var(format!("{}fwd", self.prefix())).with_dtype(x.dtype());
        Ok(match x.shape() {
            Some(shape) => out.with_shape(shape.clone()),
            None => out,
        })
    }

    fn hybrid_forward(&self, x: &NDArray, _params: &ParamData) -> Result<NDArray> {
        self.kind.apply(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gluon_core::{Context, DType};

    #[test]
    fn test_relu_block() {
        let act = Activation::with_prefix(ActivationKind::Relu, Some("act_"));
        let x = NDArray::from_f64_slice(&[-1.0, 0.5, 2.0], (1, 3), DType::F32, Context::cpu(0)).unwrap();
        let y = act.forward(&x).unwrap();
        assert_eq!(y.to_f64_vec().unwrap(), vec![0.0, 0.5, 2.0]);
        assert_eq!(act.name(), "act");
        assert_eq!(act.describe(), "Activation(relu)");
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("tanh".parse::<ActivationKind>().unwrap(), ActivationKind::Tanh);
        assert!("swish".parse::<ActivationKind>().is_err());
    }

    #[test]
    fn test_symbol_shape_passes_through() {
        let act = Activation::new(ActivationKind::Sigmoid);
        let out = act
            .infer_shape(&Symbol::var("data").with_shape((4, 2)))
            .unwrap();
        assert_eq!(out.shape().unwrap().dims(), &[4, 2]);
    }
}
