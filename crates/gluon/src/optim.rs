// Optimizer — Update rules applied to parameter replicas
//
// An optimizer sees one (weight, grad) pair at a time, identified by the
// parameter's index in the trainer's list. Anything it needs to remember
// between steps (a momentum buffer, say) lives in a state array created by
// `create_state` and handed back on every `update`. The Trainer keeps one
// Updater per context, so each replica gets its own state.
//
// SGD:
//
//   g   = clip(rescale_grad * grad) + wd * wd_mult * w
//   w  -= lr * lr_mult * g                              (momentum = 0)
//
//   mom = momentum * mom - lr * lr_mult * g             (momentum > 0)
//   w  += mom
//
// Every update first bumps the update count of its index. With a learning
// rate scheduler attached, lr is the scheduler's rate at the largest count
// so far rather than the configured learning_rate.
//
// All updates run outside any recording scope and write into the weight
// in place, so every holder of the parameter sees the new values.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::trace;

use gluon_core::{Context, Error, NDArray, RecordingScope, Result};

use crate::lr_scheduler::LrScheduler;

/// An update rule for one parameter replica at a time.
pub trait Optimizer: Send {
    fn name(&self) -> &str;

    /// Per-replica state for parameter `index`, or `None` if the rule is
    /// stateless.
    fn create_state(&self, index: usize, weight: &NDArray) -> Result<Option<NDArray>>;

    /// Apply one update to `weight` in place.
    fn update(&mut self, index: usize, weight: &NDArray, grad: &NDArray, state: Option<&NDArray>) -> Result<()>;

    fn rescale_grad(&self) -> f64;

    fn set_rescale_grad(&mut self, rescale_grad: f64);

    fn learning_rate(&self) -> f64;

    /// Fails when a scheduler owns the learning rate.
    fn set_learning_rate(&mut self, learning_rate: f64) -> Result<()>;

    /// Per-parameter learning-rate and weight-decay multipliers.
    fn set_param_multipliers(&mut self, index: usize, lr_mult: f64, wd_mult: f64);
}

/// Hyperparameters for [`Sgd`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    /// L2 weight decay.
    pub wd: f64,
    /// Gradients are multiplied by this before anything else.
    pub rescale_grad: f64,
    /// Clip rescaled gradients to `[-c, c]`.
    pub clip_gradient: Option<f64>,
}

impl Default for SgdConfig {
    fn default() -> Self {
        SgdConfig {
            learning_rate: 0.01,
            momentum: 0.0,
            wd: 0.0,
            rescale_grad: 1.0,
            clip_gradient: None,
        }
    }
}

impl SgdConfig {
    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_wd(mut self, wd: f64) -> Self {
        self.wd = wd;
        self
    }

    pub fn with_rescale_grad(mut self, rescale_grad: f64) -> Self {
        self.rescale_grad = rescale_grad;
        self
    }

    pub fn with_clip_gradient(mut self, clip: f64) -> Self {
        self.clip_gradient = Some(clip);
        self
    }
}

/// Stochastic gradient descent with optional momentum and weight decay.
#[derive(Debug)]
pub struct Sgd {
    config: SgdConfig,
    multipliers: HashMap<usize, (f64, f64)>,
    scheduler: Option<Box<dyn LrScheduler>>,
    update_counts: HashMap<usize, usize>,
    num_update: usize,
}

impl Sgd {
    pub fn new(config: SgdConfig) -> Self {
        Sgd {
            config,
            multipliers: HashMap::new(),
            scheduler: None,
            update_counts: HashMap::new(),
            num_update: 0,
        }
    }

    /// Let `scheduler` drive the learning rate, starting from the
    /// configured one.
    pub fn with_lr_scheduler(mut self, mut scheduler: impl LrScheduler + 'static) -> Self {
        scheduler.set_base_lr(self.config.learning_rate);
        self.scheduler = Some(Box::new(scheduler));
        self
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }

    pub fn lr_scheduler(&self) -> Option<&dyn LrScheduler> {
        self.scheduler.as_deref()
    }

    /// The largest number of updates applied to any one index.
    pub fn num_update(&self) -> usize {
        self.num_update
    }

    fn count_update(&mut self, index: usize) -> f64 {
        let count = self.update_counts.entry(index).or_insert(0);
        *count += 1;
        self.num_update = self.num_update.max(*count);
        match self.scheduler.as_mut() {
            Some(scheduler) => scheduler.lr(self.num_update),
            None => self.config.learning_rate,
        }
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &str {
        "sgd"
    }

    fn create_state(&self, _index: usize, weight: &NDArray) -> Result<Option<NDArray>> {
        if self.config.momentum == 0.0 {
            return Ok(None);
        }
        NDArray::zeros(weight.shape().clone(), weight.dtype(), weight.context()).map(Some)
    }

    fn update(&mut self, index: usize, weight: &NDArray, grad: &NDArray, state: Option<&NDArray>) -> Result<()> {
        if weight.shape() != grad.shape() {
            return Err(Error::ShapeMismatch {
                expected: weight.shape().clone(),
                got: grad.shape().clone(),
            });
        }
        let base_lr = self.count_update(index);
        let (lr_mult, wd_mult) = self.multipliers.get(&index).copied().unwrap_or((1.0, 1.0));
        let lr = base_lr * lr_mult;
        let wd = self.config.wd * wd_mult;

        let _pause = RecordingScope::pause(false);
        let mut w = weight.to_f64_vec()?;
        let g = grad.to_f64_vec()?;
        let effective: Vec<f64> = g
            .iter()
            .zip(&w)
            .map(|(&gi, &wi)| {
                let mut gi = gi * self.config.rescale_grad;
                if let Some(c) = self.config.clip_gradient {
                    gi = gi.clamp(-c, c);
                }
                gi + wd * wi
            })
            .collect();

        match state {
            Some(mom_array) => {
                let mut mom = mom_array.to_f64_vec()?;
                for ((wi, mi), gi) in w.iter_mut().zip(mom.iter_mut()).zip(&effective) {
                    *mi = self.config.momentum * *mi - lr * gi;
                    *wi += *mi;
                }
                mom_array.assign(&mom)?;
            }
            None => {
                for (wi, gi) in w.iter_mut().zip(&effective) {
                    *wi -= lr * gi;
                }
            }
        }
        weight.assign(&w)?;
        trace!(index, lr, wd, context = %weight.context(), "sgd update");
        Ok(())
    }

    fn rescale_grad(&self) -> f64 {
        self.config.rescale_grad
    }

    fn set_rescale_grad(&mut self, rescale_grad: f64) {
        self.config.rescale_grad = rescale_grad;
    }

    fn learning_rate(&self) -> f64 {
        match &self.scheduler {
            Some(scheduler) => scheduler.base_lr(),
            None => self.config.learning_rate,
        }
    }

    fn set_learning_rate(&mut self, learning_rate: f64) -> Result<()> {
        if self.scheduler.is_some() {
            return Err(Error::InvalidArgument(
                "the learning rate is owned by the optimizer's lr scheduler and cannot be set directly".to_string(),
            ));
        }
        self.config.learning_rate = learning_rate;
        Ok(())
    }

    fn set_param_multipliers(&mut self, index: usize, lr_mult: f64, wd_mult: f64) {
        self.multipliers.insert(index, (lr_mult, wd_mult));
    }
}

/// Look up an optimizer by name.
pub fn create(name: &str, config: SgdConfig) -> Result<Box<dyn Optimizer>> {
    match name.to_ascii_lowercase().as_str() {
        "sgd" => Ok(Box::new(Sgd::new(config))),
        other => Err(Error::InvalidArgument(format!(
            "unknown optimizer '{other}'. Supported: sgd"
        ))),
    }
}

/// Optimizer state for the replicas living on one context.
#[derive(Debug, Default)]
pub struct Updater {
    states: BTreeMap<usize, Option<NDArray>>,
}

impl Updater {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update `weight`, creating its state on first use.
    pub fn update(&mut self, optimizer: &mut dyn Optimizer, index: usize, weight: &NDArray, grad: &NDArray) -> Result<()> {
        if !self.states.contains_key(&index) {
            let state = optimizer.create_state(index, weight)?;
            self.states.insert(index, state);
        }
        let state = self.states.get(&index).and_then(|s| s.as_ref());
        optimizer.update(index, weight, grad, state)
    }

    pub fn state(&self, index: usize) -> Option<&NDArray> {
        self.states.get(&index).and_then(|s| s.as_ref())
    }

    /// Every non-empty state, by parameter index.
    pub fn states(&self) -> Vec<(usize, NDArray)> {
        self.states
            .iter()
            .filter_map(|(&i, s)| s.as_ref().map(|s| (i, s.clone())))
            .collect()
    }

    /// Replace all states, moving each one onto `context`.
    pub fn set_states(&mut self, states: Vec<(usize, NDArray)>, context: Context) -> Result<()> {
        let mut restored = BTreeMap::new();
        for (index, state) in states {
            restored.insert(index, Some(state.copy_to(context)?));
        }
        self.states = restored;
        Ok(())
    }
}
