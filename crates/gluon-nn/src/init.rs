// nn::init — Initializers for parameter arrays
//
// An Initializer fills a freshly allocated array in place. Parameters call
// it once, on a zero array, at materialization time (with autograd paused).
//
// ROUTING:
//
//   apply(desc, arr) looks at the InitDesc first. If it carries an override
//   (the parameter's own initializer), that initializer's init_weight is
//   used whatever the name. Otherwise the name suffix decides:
//
//     *weight → init_weight      *gamma → init_gamma (ones)
//     *bias   → init_bias (zero) *beta  → init_beta  (zero)
//
//   and any other name falls back to init_weight.
//
// AVAILABLE INITIALIZERS:
//
//   Zero / One / Constant(v)   — fixed values
//   Uniform(scale)             — U(-scale, scale), default scale 0.07
//   Normal(sigma)              — N(0, sigma²), default sigma 0.01
//   Xavier                     — Glorot scaling from the array's fans
//   ConstantArray(arr)         — copies a fixed array (backs Constant params)
//
// `create(name)` looks initializers up by their registry name.

use std::fmt;
use std::sync::Arc;

use gluon_core::{Error, NDArray, Result, Shape};

/// Shared handle to an initializer.
pub type InitRef = Arc<dyn Initializer>;

/// Describes the array being initialized.
#[derive(Clone, Debug)]
pub struct InitDesc {
    name: String,
    init_override: Option<InitRef>,
}

impl InitDesc {
    pub fn new(name: impl Into<String>) -> Self {
        InitDesc {
            name: name.into(),
            init_override: None,
        }
    }

    /// Force `init` for this array instead of suffix routing.
    pub fn with_override(mut self, init: InitRef) -> Self {
        self.init_override = Some(init);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn init_override(&self) -> Option<&InitRef> {
        self.init_override.as_ref()
    }
}

/// Strategy that fills an array in place.
pub trait Initializer: Send + Sync + fmt::Debug {
    /// Fill a weight-like array.
    fn init_weight(&self, desc: &InitDesc, arr: &NDArray) -> Result<()>;

    fn init_bias(&self, _desc: &InitDesc, arr: &NDArray) -> Result<()> {
        arr.fill(0.0);
        Ok(())
    }

    fn init_gamma(&self, _desc: &InitDesc, arr: &NDArray) -> Result<()> {
        arr.fill(1.0);
        Ok(())
    }

    fn init_beta(&self, _desc: &InitDesc, arr: &NDArray) -> Result<()> {
        arr.fill(0.0);
        Ok(())
    }

    /// Initialize `arr`, honoring the override in `desc` or else routing by
    /// name suffix.
    fn apply(&self, desc: &InitDesc, arr: &NDArray) -> Result<()> {
        if let Some(init) = desc.init_override() {
            return init.init_weight(desc, arr);
        }
        let name = desc.name();
        if name.ends_with("weight") {
            self.init_weight(desc, arr)
        } else if name.ends_with("bias") {
            self.init_bias(desc, arr)
        } else if name.ends_with("gamma") {
            self.init_gamma(desc, arr)
        } else if name.ends_with("beta") {
            self.init_beta(desc, arr)
        } else {
            self.init_weight(desc, arr)
        }
    }
}

/// All zeros.
#[derive(Debug, Clone, Copy, Default)]
pub struct Zero;

impl Initializer for Zero {
    fn init_weight(&self, _desc: &InitDesc, arr: &NDArray) -> Result<()> {
        arr.fill(0.0);
        Ok(())
    }
}

/// All ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct One;

impl Initializer for One {
    fn init_weight(&self, _desc: &InitDesc, arr: &NDArray) -> Result<()> {
        arr.fill(1.0);
        Ok(())
    }
}

/// Every element set to `value`.
#[derive(Debug, Clone, Copy)]
pub struct Constant {
    pub value: f64,
}

impl Constant {
    pub fn new(value: f64) -> Self {
        Constant { value }
    }
}

impl Initializer for Constant {
    fn init_weight(&self, _desc: &InitDesc, arr: &NDArray) -> Result<()> {
        arr.fill(self.value);
        Ok(())
    }
}

/// Samples from U(-scale, scale).
#[derive(Debug, Clone, Copy)]
pub struct Uniform {
    pub scale: f64,
}

impl Uniform {
    pub fn new(scale: f64) -> Self {
        Uniform { scale }
    }
}

impl Default for Uniform {
    fn default() -> Self {
        Uniform { scale: 0.07 }
    }
}

impl Initializer for Uniform {
    fn init_weight(&self, _desc: &InitDesc, arr: &NDArray) -> Result<()> {
        arr.fill_uniform(-self.scale, self.scale)
    }
}

/// Samples from N(0, sigma²).
#[derive(Debug, Clone, Copy)]
pub struct Normal {
    pub sigma: f64,
}

impl Normal {
    pub fn new(sigma: f64) -> Self {
        Normal { sigma }
    }
}

impl Default for Normal {
    fn default() -> Self {
        Normal { sigma: 0.01 }
    }
}

impl Initializer for Normal {
    fn init_weight(&self, _desc: &InitDesc, arr: &NDArray) -> Result<()> {
        arr.fill_normal(0.0, self.sigma)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XavierRand {
    Uniform,
    Gaussian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanType {
    /// (fan_in + fan_out) / 2
    Avg,
    In,
    Out,
}

/// Glorot initialization: scale = sqrt(magnitude / factor).
#[derive(Debug, Clone, Copy)]
pub struct Xavier {
    pub rnd_type: XavierRand,
    pub factor_type: FanType,
    pub magnitude: f64,
}

impl Default for Xavier {
    fn default() -> Self {
        Xavier {
            rnd_type: XavierRand::Uniform,
            factor_type: FanType::Avg,
            magnitude: 3.0,
        }
    }
}

/// (fan_in, fan_out) of a weight shaped `[out, in, k...]`.
fn compute_fans(shape: &Shape) -> Option<(f64, f64)> {
    let dims = shape.dims();
    if dims.len() < 2 {
        return None;
    }
    let receptive: usize = dims[2..].iter().product();
    Some((
        (dims[1] * receptive) as f64,
        (dims[0] * receptive) as f64,
    ))
}

impl Initializer for Xavier {
    fn init_weight(&self, desc: &InitDesc, arr: &NDArray) -> Result<()> {
        let (fan_in, fan_out) = compute_fans(arr.shape()).ok_or_else(|| {
            Error::invalid_shape(
                desc.name(),
                format!(
                    "Xavier initializer needs at least 2 dimensions, got {}",
                    arr.shape()
                ),
            )
        })?;
        let factor = match self.factor_type {
            FanType::Avg => (fan_in + fan_out) / 2.0,
            FanType::In => fan_in,
            FanType::Out => fan_out,
        };
        let scale = (self.magnitude / factor).sqrt();
        match self.rnd_type {
            XavierRand::Uniform => arr.fill_uniform(-scale, scale),
            XavierRand::Gaussian => arr.fill_normal(0.0, scale),
        }
    }
}

/// Copies a fixed array into the target.
#[derive(Debug, Clone)]
pub struct ConstantArray {
    value: NDArray,
}

impl ConstantArray {
    pub fn new(value: NDArray) -> Self {
        ConstantArray { value }
    }

    pub fn value(&self) -> &NDArray {
        &self.value
    }
}

impl Initializer for ConstantArray {
    fn init_weight(&self, _desc: &InitDesc, arr: &NDArray) -> Result<()> {
        arr.copy_from(&self.value)
    }
}

/// Look an initializer up by registry name.
pub fn create(name: &str) -> Result<InitRef> {
    let init: InitRef = match name.to_ascii_lowercase().as_str() {
        "zeros" | "zero" => Arc::new(Zero),
        "ones" | "one" => Arc::new(One),
        "uniform" => Arc::new(Uniform::default()),
        "normal" => Arc::new(Normal::default()),
        "xavier" => Arc::new(Xavier::default()),
        other => {
            return Err(Error::InvalidArgument(format!(
                "unknown initializer '{other}'"
            )))
        }
    };
    Ok(init)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gluon_core::{Context, DType};

    fn zeros(shape: impl Into<Shape>) -> NDArray {
        NDArray::zeros(shape, DType::F64, Context::cpu(0)).unwrap()
    }

    #[test]
    fn test_suffix_routing() {
        let init = Constant::new(5.0);
        let w = zeros(3);
        let b = zeros(3);
        let g = zeros(3);
        init.apply(&InitDesc::new("dense0_weight"), &w).unwrap();
        init.apply(&InitDesc::new("dense0_bias"), &b).unwrap();
        init.apply(&InitDesc::new("bn0_gamma"), &g).unwrap();
        assert_eq!(w.to_f64_vec().unwrap(), vec![5.0; 3]);
        assert_eq!(b.to_f64_vec().unwrap(), vec![0.0; 3]);
        assert_eq!(g.to_f64_vec().unwrap(), vec![1.0; 3]);
    }

    #[test]
    fn test_override_wins_over_suffix() {
        let desc = InitDesc::new("dense0_bias").with_override(Arc::new(One));
        let b = zeros(2);
        Zero.apply(&desc, &b).unwrap();
        assert_eq!(b.to_f64_vec().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_unknown_suffix_uses_init_weight() {
        let a = zeros(2);
        Constant::new(2.0)
            .apply(&InitDesc::new("running_thing"), &a)
            .unwrap();
        assert_eq!(a.to_f64_vec().unwrap(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_uniform_default_range() {
        let a = zeros(1000);
        Uniform::default()
            .apply(&InitDesc::new("w_weight"), &a)
            .unwrap();
        let v = a.to_f64_vec().unwrap();
        assert!(v.iter().all(|&x| (-0.07..=0.07).contains(&x)));
        assert!(v.iter().any(|&x| x != 0.0));
    }

    #[test]
    fn test_xavier_bounds() {
        // fan_in = 100, fan_out = 50 → scale = sqrt(3 / 75)
        let a = zeros((50, 100));
        Xavier::default().apply(&InitDesc::new("fc_weight"), &a).unwrap();
        let bound = (3.0f64 / 75.0).sqrt();
        assert!(a.to_f64_vec().unwrap().iter().all(|&x| x.abs() <= bound));
    }

    #[test]
    fn test_xavier_rejects_vectors() {
        let a = zeros(4);
        assert!(Xavier::default().apply(&InitDesc::new("v_weight"), &a).is_err());
    }

    #[test]
    fn test_registry() {
        assert!(create("xavier").is_ok());
        assert!(create("Zeros").is_ok());
        assert!(create("orthogonal").is_err());
    }
}
