// Symbol — Placeholder for a value inside a traced computation
//
// A Symbol carries a name, a (possibly unknown) shape and a dtype, but no
// data. Hybrid blocks fed a Symbol instead of an NDArray run shape
// propagation only: each layer resolves the shapes of its own parameters
// from the incoming symbol and returns the symbol of its output.

use std::fmt;

use gluon_core::{DType, Error, NDArray, Result, Shape};

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    name: String,
    shape: Option<Shape>,
    dtype: DType,
}

impl Symbol {
    /// A free variable with no shape information.
    pub fn var(name: impl Into<String>) -> Self {
        Symbol {
            name: name.into(),
            shape: None,
            dtype: DType::default(),
        }
    }

    /// The symbol standing for a concrete array.
    pub fn from_array(name: impl Into<String>, arr: &NDArray) -> Self {
        Symbol {
            name: name.into(),
            shape: Some(arr.shape().clone()),
            dtype: arr.dtype(),
        }
    }

    pub fn with_shape(mut self, shape: impl Into<Shape>) -> Self {
        self.shape = Some(shape.into());
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> Option<&Shape> {
        self.shape.as_ref()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// The shape, or an error if it has not been inferred.
    pub fn known_shape(&self) -> Result<&Shape> {
        self.shape.as_ref().ok_or_else(|| {
            Error::invalid_shape(&self.name, "symbol has no shape to infer from")
        })
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.shape {
            Some(shape) => write!(f, "<Symbol {} {} {}>", self.name, shape, self.dtype),
            None => write!(f, "<Symbol {} {}>", self.name, self.dtype),
        }
    }
}
