// Trainer — Applies an optimizer to a fixed list of parameters
//
// The parameter list is flattened once at construction and never changes;
// its order defines the index each parameter is known by inside the
// optimizer and its updaters. Every parameter must live on the same
// ordered list of contexts, because updater `c` owns the state of every
// parameter's replica `c`.
//
// ONE STEP:
//
//   1. rescale_grad = scale / batch_size
//   2. sum each parameter's gradient replicas so every context sees the
//      total (step only; update skips this)
//   3. refuse gradients no backward pass refreshed since the last step,
//      unless ignore_stale_grad is set
//   4. for every (parameter, replica): updater[c].update(i, data, grad)
//
// Parameters whose grad_req is null have no gradient replicas, so they
// contribute no work in steps 2-4.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use gluon_core::{format_contexts, safetensors, Context, Error, NDArray, Result};
use gluon_nn::{Parameter, ParameterDict};

use crate::optim::{self, Optimizer, SgdConfig, Updater};

/// Settings for [`Trainer`]. Readable from JSON:
///
/// ```json
/// { "optimizer": "sgd",
///   "optimizer_params": { "learning_rate": 0.1, "momentum": 0.9 },
///   "ignore_stale_grad": false }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Optimizer name for [`Trainer::from_config`].
    pub optimizer: String,
    pub optimizer_params: SgdConfig,
    /// Default for [`Trainer::step`] and [`Trainer::update`].
    pub ignore_stale_grad: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            optimizer: "sgd".to_string(),
            optimizer_params: SgdConfig::default(),
            ignore_stale_grad: false,
        }
    }
}

impl TrainerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_optimizer(mut self, name: impl Into<String>, params: SgdConfig) -> Self {
        self.optimizer = name.into();
        self.optimizer_params = params;
        self
    }

    pub fn with_ignore_stale_grad(mut self, ignore: bool) -> Self {
        self.ignore_stale_grad = ignore;
        self
    }
}

/// Anything a trainer can take its parameters from.
pub trait IntoParamList {
    fn into_param_list(self) -> Vec<Parameter>;
}

impl IntoParamList for &ParameterDict {
    fn into_param_list(self) -> Vec<Parameter> {
        self.values()
    }
}

impl IntoParamList for ParameterDict {
    fn into_param_list(self) -> Vec<Parameter> {
        self.values()
    }
}

impl IntoParamList for &[ParameterDict] {
    fn into_param_list(self) -> Vec<Parameter> {
        self.iter().flat_map(|d| d.values()).collect()
    }
}

impl IntoParamList for Vec<Parameter> {
    fn into_param_list(self) -> Vec<Parameter> {
        self
    }
}

impl IntoParamList for &[Parameter] {
    fn into_param_list(self) -> Vec<Parameter> {
        self.to_vec()
    }
}

/// Drives an [`Optimizer`] over a list of parameters.
pub struct Trainer {
    params: Vec<Parameter>,
    contexts: Vec<Context>,
    optimizer: Box<dyn Optimizer>,
    updaters: Vec<Updater>,
    scale: f64,
    config: TrainerConfig,
}

impl Trainer {
    /// Build a trainer around `optimizer`. `config.optimizer` and
    /// `config.optimizer_params` are not consulted; see
    /// [`Trainer::from_config`].
    ///
    /// A parameter listed twice is kept once.
    pub fn new(params: impl IntoParamList, optimizer: Box<dyn Optimizer>, config: TrainerConfig) -> Result<Self> {
        let mut unique: Vec<Parameter> = Vec::new();
        for p in params.into_param_list() {
            if !unique.iter().any(|q| q.ptr_eq(&p)) {
                unique.push(p);
            }
        }
        let contexts = check_contexts(&unique)?;
        let updaters = contexts.iter().map(|_| Updater::new()).collect();
        let scale = optimizer.rescale_grad();
        debug!(
            params = unique.len(),
            contexts = %format_contexts(&contexts),
            optimizer = optimizer.name(),
            "trainer created"
        );
        Ok(Trainer {
            params: unique,
            contexts,
            optimizer,
            updaters,
            scale,
            config,
        })
    }

    /// Build the optimizer named in `config` and a trainer around it.
    pub fn from_config(params: impl IntoParamList, config: TrainerConfig) -> Result<Self> {
        let optimizer = optim::create(&config.optimizer, config.optimizer_params.clone())?;
        Self::new(params, optimizer, config)
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Fails when the optimizer's learning rate is driven by a scheduler.
    pub fn set_learning_rate(&mut self, learning_rate: f64) -> Result<()> {
        self.optimizer.set_learning_rate(learning_rate)
    }

    /// Sum gradients across replicas, then update every parameter.
    /// Gradients are normalized by `1 / batch_size`.
    pub fn step(&mut self, batch_size: usize) -> Result<()> {
        self.step_with(batch_size, self.config.ignore_stale_grad)
    }

    pub fn step_with(&mut self, batch_size: usize, ignore_stale_grad: bool) -> Result<()> {
        self.set_batch_size(batch_size)?;
        self.allreduce_grads()?;
        self.apply_updates(ignore_stale_grad)
    }

    /// Like [`Trainer::step`], but without summing gradients first. Use
    /// after calling [`Trainer::allreduce_grads`] yourself.
    pub fn update(&mut self, batch_size: usize) -> Result<()> {
        self.update_with(batch_size, self.config.ignore_stale_grad)
    }

    pub fn update_with(&mut self, batch_size: usize, ignore_stale_grad: bool) -> Result<()> {
        self.set_batch_size(batch_size)?;
        self.apply_updates(ignore_stale_grad)
    }

    /// Overwrite each gradient replica with the sum over all replicas of
    /// the same parameter.
    pub fn allreduce_grads(&self) -> Result<()> {
        if self.contexts.len() < 2 {
            return Ok(());
        }
        for param in &self.params {
            let replicas = param.grad_replicas()?;
            let Some((_, first)) = replicas.first() else {
                continue;
            };
            let mut total = vec![0.0; first.elem_count()];
            for (_, grad) in &replicas {
                for (t, g) in total.iter_mut().zip(grad.to_f64_vec()?) {
                    *t += g;
                }
            }
            for (_, grad) in &replicas {
                grad.assign(&total)?;
            }
        }
        Ok(())
    }

    fn set_batch_size(&mut self, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(Error::InvalidArgument("batch_size must be positive".to_string()));
        }
        self.optimizer.set_rescale_grad(self.scale / batch_size as f64);
        Ok(())
    }

    fn apply_updates(&mut self, ignore_stale_grad: bool) -> Result<()> {
        let mut work = Vec::with_capacity(self.params.len());
        for param in &self.params {
            let replicas = param.grad_replicas()?;
            if !ignore_stale_grad {
                if let Some((data, _)) = replicas.iter().find(|(data, _)| !data.fresh_grad()) {
                    return Err(Error::StaleGradient {
                        name: param.name(),
                        context: data.context().to_string(),
                    });
                }
            }
            work.push(replicas);
        }

        for (index, (param, replicas)) in self.params.iter().zip(work).enumerate() {
            self.optimizer
                .set_param_multipliers(index, param.lr_mult(), param.wd_mult());
            for (updater, (data, grad)) in self.updaters.iter_mut().zip(replicas) {
                if !data.fresh_grad() && ignore_stale_grad {
                    continue;
                }
                updater.update(self.optimizer.as_mut(), index, &data, &grad)?;
                data.set_fresh_grad(false);
            }
        }
        Ok(())
    }

    /// Write every optimizer state tensor to a safetensors file.
    pub fn save_states(&self, path: impl AsRef<Path>) -> Result<()> {
        let tensors: Vec<(String, NDArray)> = self
            .updaters
            .iter()
            .enumerate()
            .flat_map(|(c, updater)| {
                updater
                    .states()
                    .into_iter()
                    .map(move |(i, state)| (format!("{c}.{i}"), state))
            })
            .collect();
        safetensors::save(path.as_ref(), &tensors)?;
        debug!(path = %path.as_ref().display(), tensors = tensors.len(), "saved trainer states");
        Ok(())
    }

    /// Replace the optimizer states with those saved by
    /// [`Trainer::save_states`].
    pub fn load_states(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let loaded = safetensors::load(path.as_ref(), Context::cpu(0))?;
        let mut per_context: Vec<Vec<(usize, NDArray)>> = self.contexts.iter().map(|_| Vec::new()).collect();
        for (key, state) in loaded {
            let (c, i) = parse_state_key(&key)?;
            if c >= per_context.len() {
                return Err(Error::Persistence(format!(
                    "state '{key}' belongs to context #{c}, but this trainer runs on {} context(s)",
                    per_context.len()
                )));
            }
            if i >= self.params.len() {
                return Err(Error::Persistence(format!(
                    "state '{key}' belongs to parameter #{i}, but this trainer has {} parameter(s)",
                    self.params.len()
                )));
            }
            per_context[c].push((i, state));
        }
        for ((updater, states), &context) in self.updaters.iter_mut().zip(per_context).zip(&self.contexts) {
            updater.set_states(states, context)?;
        }
        debug!(path = %path.as_ref().display(), "loaded trainer states");
        Ok(())
    }
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("params", &self.params.len())
            .field("contexts", &self.contexts)
            .field("optimizer", &self.optimizer.name())
            .field("scale", &self.scale)
            .finish()
    }
}

/// The context list shared by every parameter.
fn check_contexts(params: &[Parameter]) -> Result<Vec<Context>> {
    let Some((first, rest)) = params.split_first() else {
        return Err(Error::InvalidArgument(
            "a trainer needs at least one parameter to optimize".to_string(),
        ));
    };
    let expected = first.list_ctx()?;
    for param in rest {
        let contexts = param.list_ctx()?;
        if contexts != expected {
            return Err(Error::InconsistentContexts {
                name: param.name(),
                expected: format_contexts(&expected),
                got: format_contexts(&contexts),
            });
        }
    }
    Ok(expected)
}

fn parse_state_key(key: &str) -> Result<(usize, usize)> {
    let bad = || Error::Persistence(format!("'{key}' is not a trainer state name"));
    let (c, i) = key.split_once('.').ok_or_else(bad)?;
    Ok((c.parse().map_err(|_| bad())?, i.parse().map_err(|_| bad())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gluon_core::DType;
    use gluon_nn::{init::One, InitOptions, ParamAttrs};

    fn param(name: &str, contexts: &[Context]) -> Parameter {
        let p = Parameter::new(name, ParamAttrs::new().with_shape(2).with_dtype(DType::F64));
        p.init(InitOptions::new().with_init(One).with_contexts(contexts.to_vec()))
            .unwrap();
        p
    }

    #[test]
    fn test_empty_list_rejected() {
        let err = Trainer::from_config(Vec::<Parameter>::new(), TrainerConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_duplicates_kept_once() {
        let p = param("w", &[Context::cpu(0)]);
        let trainer = Trainer::from_config(vec![p.clone(), p], TrainerConfig::default()).unwrap();
        assert_eq!(trainer.params().len(), 1);
    }

    #[test]
    fn test_allreduce_sums_replicas() {
        let p = param("w", &[Context::cpu(0), Context::cpu(1)]);
        let grads = p.list_grad().unwrap();
        grads[0].assign(&[1.0, 2.0]).unwrap();
        grads[1].assign(&[3.0, 4.0]).unwrap();
        let trainer = Trainer::from_config(vec![p.clone()], TrainerConfig::default()).unwrap();
        trainer.allreduce_grads().unwrap();
        for g in p.list_grad().unwrap() {
            assert_eq!(g.to_f64_vec().unwrap(), vec![4.0, 6.0]);
        }
    }

    #[test]
    fn test_zero_batch_size() {
        let p = param("w", &[Context::cpu(0)]);
        let mut trainer = Trainer::from_config(vec![p], TrainerConfig::default()).unwrap();
        assert!(trainer.step(0).is_err());
    }

    #[test]
    fn test_state_key_parsing() {
        assert_eq!(parse_state_key("1.7").unwrap(), (1, 7));
        assert!(parse_state_key("weights").is_err());
        assert!(parse_state_key("a.1").is_err());
    }

    #[test]
    fn test_config_from_json() {
        let config = TrainerConfig::from_json(
            r#"{"optimizer_params": {"learning_rate": 0.5}, "ignore_stale_grad": true}"#,
        )
        .unwrap();
        assert_eq!(config.optimizer, "sgd");
        assert_eq!(config.optimizer_params.learning_rate, 0.5);
        assert!(config.ignore_stale_grad);
    }
}
