// Dense — Fully-connected layer
//
//   y = act(flatten(x) · weightᵀ + bias)
//
// PARAMETER SHAPES:
//
//   weight: [units, in_units]   in_units may be 0 ("infer on first forward")
//   bias:   [units]
//
// With in_units = 0 the weight starts deferred. The first forward flattens
// the input to [batch, features], fixes in_units = features and
// materializes the weight on the input's context.
//
// INITIALIZATION:
//
// The weight has no initializer of its own unless one is configured, so it
// follows whatever default `initialize()` is given. The bias is
// initialized with zeros unless configured otherwise.

use std::sync::Arc;

use gluon_core::{DType, Error, NDArray, Result};

use crate::activation::{Activation, ActivationKind};
use crate::block::{Block, BlockCore, ChildRef, ParamRef};
use crate::hybrid::{self, HybridBlock, ParamData};
use crate::init::{InitRef, Initializer, Zero};
use crate::parameter::{ParamAttrs, Parameter};
use crate::parameter_dict::ParameterDict;
use crate::symbol::Symbol;

/// Configuration for [`Dense`].
#[derive(Clone, Debug)]
pub struct DenseConfig {
    pub use_bias: bool,
    /// Input width; 0 defers it to the first forward pass.
    pub in_units: usize,
    pub activation: Option<ActivationKind>,
    pub dtype: DType,
    pub weight_initializer: Option<InitRef>,
    pub bias_initializer: InitRef,
    pub prefix: Option<String>,
    /// Share parameters with this dict instead of creating new ones.
    pub params: Option<ParameterDict>,
}

impl Default for DenseConfig {
    fn default() -> Self {
        DenseConfig {
            use_bias: true,
            in_units: 0,
            activation: None,
            dtype: DType::F32,
            weight_initializer: None,
            bias_initializer: Arc::new(Zero),
            prefix: None,
            params: None,
        }
    }
}

impl DenseConfig {
    pub fn with_use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    pub fn with_in_units(mut self, in_units: usize) -> Self {
        self.in_units = in_units;
        self
    }

    pub fn with_activation(mut self, activation: ActivationKind) -> Self {
        self.activation = Some(activation);
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_weight_initializer(mut self, init: impl Initializer + 'static) -> Self {
        self.weight_initializer = Some(Arc::new(init));
        self
    }

    pub fn with_bias_initializer(mut self, init: impl Initializer + 'static) -> Self {
        self.bias_initializer = Arc::new(init);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_params(mut self, params: &ParameterDict) -> Self {
        self.params = Some(params.clone());
        self
    }
}

/// A fully-connected layer.
pub struct Dense {
    core: BlockCore,
    units: usize,
    weight: ParamRef,
    bias: Option<ParamRef>,
    act: Option<ChildRef>,
}

impl Dense {
    pub fn new(units: usize, config: DenseConfig) -> Result<Self> {
        let mut core = BlockCore::new(config.prefix.as_deref(), config.params.as_ref(), "dense");
        let (weight, bias, act) = {
            let _scope = core.name_scope();
            let mut attrs = ParamAttrs::new()
                .with_shape((units, config.in_units))
                .with_dtype(config.dtype)
                .with_allow_deferred_init(true);
            if let Some(init) = &config.weight_initializer {
                attrs = attrs.with_init_ref(Arc::clone(init));
            }
            let weight = core.params().get("weight", attrs)?;
            let bias = if config.use_bias {
                let attrs = ParamAttrs::new()
                    .with_shape(units)
                    .with_dtype(config.dtype)
                    .with_init_ref(Arc::clone(&config.bias_initializer))
                    .with_allow_deferred_init(true);
                Some(core.params().get("bias", attrs)?)
            } else {
                None
            };
            let act = config
                .activation
                .map(|kind| Activation::with_prefix(kind, Some(&format!("{kind}_"))));
            (weight, bias, act)
        };
        let weight = core.register_parameter("weight", weight)?;
        let bias = bias
            .map(|b| core.register_parameter("bias", b))
            .transpose()?;
        let act = act
            .map(|a| core.register_hybrid_child(Some("act"), a))
            .transpose()?;
        Ok(Dense {
            core,
            units,
            weight,
            bias,
            act,
        })
    }

    pub fn units(&self) -> usize {
        self.units
    }

    /// Input width, or 0 while it is still unknown.
    pub fn in_units(&self) -> usize {
        self.weight()
            .shape()
            .and_then(|s| s.dims().get(1).copied())
            .unwrap_or(0)
    }

    pub fn weight(&self) -> &Parameter {
        self.core.param(self.weight)
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.map(|b| self.core.param(b))
    }

    fn activation(&self) -> Option<&dyn Block> {
        self.act.map(|a| self.core.child(a))
    }
}

impl Block for Dense {
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
        let in_units = match self.in_units() {
            0 => "None".to_string(),
            n => n.to_string(),
        };
        let act = match self.activation() {
            Some(a) => a.describe(),
            None => "linear".to_string(),
        };
        format!("Dense({in_units} -> {}, {act})", self.units)
    }
}

impl HybridBlock for Dense {
    fn infer_shape(&self, x: &Symbol) -> Result<Symbol> {
        let shape = x.known_shape()?;
        let dims = shape.dims();
        if dims.len() < 2 {
            return Err(Error::invalid_shape(
                self.weight().name(),
                format!("dense input needs a batch axis, got shape {shape}"),
            ));
        }
        let in_units: usize = dims[1..].iter().product();
        self.weight().set_shape((self.units, in_units))?;
        let out = Symbol::var(format!("{}fwd", self.prefix()))
            .with_shape((dims[0], self.units))
            .with_dtype(x.dtype());
        match self.activation() {
            Some(act) => hybrid::require_hybrid(act, "Dense")?.infer_shape(&out),
            None => Ok(out),
        }
    }

    fn hybrid_forward(&self, x: &NDArray, params: &ParamData) -> Result<NDArray> {
        let out = NDArray::fully_connected(x, params.get("weight")?, params.maybe("bias"))?;
        match self.activation() {
            Some(act) => act.forward(&out),
            None => Ok(out),
        }
    }
}
