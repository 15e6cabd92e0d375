//! Optimizers over a model's parameter map
//!
//! Adam for supervised fine-tuning and LARS (layer-wise adaptive rate
//! scaling) for large-batch contrastive pretraining. Both operate directly on
//! the model's [`VarMap`] and serialize their moment/momentum state through
//! [`OptimizerStateDict`] so checkpoints restore bit-identical updates.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::error::{Error, Result};

/// Serialized tensor payload inside an optimizer state dict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorState {
    /// Tensor shape
    pub shape: Vec<usize>,
    /// Flattened row-major data
    pub data: Vec<f32>,
}

impl TensorState {
    fn from_tensor(t: &Tensor) -> Result<Self> {
        Ok(Self {
            shape: t.shape().dims().to_vec(),
            data: t.flatten_all()?.to_vec1::<f32>()?,
        })
    }

    fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.data.clone(), self.shape.as_slice(), device)?)
    }
}

/// Optimizer state for checkpointing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerStateDict {
    /// Optimizer type name
    pub optimizer_type: String,
    /// Update steps taken so far
    pub step_count: usize,
    /// Current learning rate
    pub learning_rate: f64,
    /// Per-parameter state tensors (moments, momentum buffers)
    pub tensors: HashMap<String, TensorState>,
    /// Scalar hyperparameters
    pub hyperparameters: HashMap<String, f64>,
}

impl OptimizerStateDict {
    /// Serialize for the checkpoint file
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Other(e.into()))
    }

    /// Deserialize from a checkpoint file
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Other(e.into()))
    }
}

/// Parameter update strategy tied 1:1 to a model instance
pub trait Optimizer: Send {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Reset accumulated gradients. Gradients here are materialized fresh by
    /// each backward pass, so this only resets bookkeeping, but it stays in
    /// the step protocol so alternative backends can hook it.
    fn zero_grad(&mut self);

    /// Apply one update from the given gradients
    fn step(&mut self, grads: &GradStore) -> Result<()>;

    /// Current learning rate
    fn learning_rate(&self) -> f64;

    /// Set the learning rate (warmup, stage decay, annealing)
    fn set_learning_rate(&mut self, lr: f64);

    /// Number of update steps taken
    fn step_count(&self) -> usize;

    /// Snapshot state for checkpointing
    fn state_dict(&self) -> Result<OptimizerStateDict>;

    /// Restore state from a checkpoint
    fn load_state_dict(&mut self, state: OptimizerStateDict) -> Result<()>;
}

/// Device the model's parameters live on
fn parameter_device(var_map: &VarMap) -> Device {
    var_map
        .all_vars()
        .first()
        .map(|v| v.device().clone())
        .unwrap_or(Device::Cpu)
}

/// Named parameters in deterministic order
fn named_vars(var_map: &VarMap) -> Vec<(String, Var)> {
    let data = var_map.data().lock().expect("var map mutex poisoned");
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

/// Adam optimizer with bias-corrected first and second moments
pub struct AdamOptimizer {
    var_map: VarMap,
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    step_count: usize,
    first_moments: HashMap<String, Tensor>,
    second_moments: HashMap<String, Tensor>,
}

impl AdamOptimizer {
    /// Create an Adam optimizer over a model's parameters
    pub fn new(var_map: VarMap, learning_rate: f64) -> Self {
        Self {
            var_map,
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            step_count: 0,
            first_moments: HashMap::new(),
            second_moments: HashMap::new(),
        }
    }
}

impl Optimizer for AdamOptimizer {
    fn name(&self) -> &str {
        "adam"
    }

    fn zero_grad(&mut self) {}

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_count += 1;
        let t = self.step_count as i32;
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);

        for (name, var) in named_vars(&self.var_map) {
            let Some(grad) = grads.get(&var) else {
                continue;
            };
            let m = match self.first_moments.get(&name) {
                Some(m) => ((m * self.beta1)? + (grad * (1.0 - self.beta1))?)?,
                None => (grad * (1.0 - self.beta1))?,
            };
            let v = match self.second_moments.get(&name) {
                Some(v) => ((v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?,
                None => (grad.sqr()? * (1.0 - self.beta2))?,
            };

            let m_hat = (&m / bias1)?;
            let v_hat = (&v / bias2)?;
            let update = ((m_hat * self.learning_rate)? / (v_hat.sqrt()? + self.epsilon)?)?;
            var.set(&(var.as_tensor() - &update)?)?;

            self.first_moments.insert(name.clone(), m);
            self.second_moments.insert(name, v);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn step_count(&self) -> usize {
        self.step_count
    }

    fn state_dict(&self) -> Result<OptimizerStateDict> {
        let mut tensors = HashMap::new();
        for (name, t) in &self.first_moments {
            tensors.insert(format!("{name}.m"), TensorState::from_tensor(t)?);
        }
        for (name, t) in &self.second_moments {
            tensors.insert(format!("{name}.v"), TensorState::from_tensor(t)?);
        }
        let mut hyperparameters = HashMap::new();
        hyperparameters.insert("beta1".to_string(), self.beta1);
        hyperparameters.insert("beta2".to_string(), self.beta2);
        hyperparameters.insert("epsilon".to_string(), self.epsilon);
        Ok(OptimizerStateDict {
            optimizer_type: self.name().to_string(),
            step_count: self.step_count,
            learning_rate: self.learning_rate,
            tensors,
            hyperparameters,
        })
    }

    fn load_state_dict(&mut self, state: OptimizerStateDict) -> Result<()> {
        if state.optimizer_type != self.name() {
            return Err(Error::config(format!(
                "checkpoint holds '{}' state, expected '{}'",
                state.optimizer_type,
                self.name()
            )));
        }
        self.step_count = state.step_count;
        self.learning_rate = state.learning_rate;
        let device = parameter_device(&self.var_map);
        self.first_moments.clear();
        self.second_moments.clear();
        for (key, tensor_state) in &state.tensors {
            let tensor = tensor_state.to_tensor(&device)?;
            if let Some(name) = key.strip_suffix(".m") {
                self.first_moments.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_suffix(".v") {
                self.second_moments.insert(name.to_string(), tensor);
            }
        }
        Ok(())
    }
}

/// LARS optimizer: SGD with momentum, weight decay and a per-layer trust
/// ratio scaling the learning rate by `eta * ||w|| / (||g|| + wd * ||w||)`.
pub struct LarsOptimizer {
    var_map: VarMap,
    learning_rate: f64,
    momentum: f64,
    weight_decay: f64,
    eta: f64,
    exclude_from_weight_decay: Vec<String>,
    step_count: usize,
    momentum_buffers: HashMap<String, Tensor>,
}

impl LarsOptimizer {
    /// Create a LARS optimizer over a model's parameters
    pub fn new(var_map: VarMap, learning_rate: f64, weight_decay: f64) -> Self {
        Self {
            var_map,
            learning_rate,
            momentum: 0.9,
            weight_decay,
            eta: 1e-3,
            exclude_from_weight_decay: vec!["bias".to_string(), "batch_norm".to_string()],
            step_count: 0,
            momentum_buffers: HashMap::new(),
        }
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.exclude_from_weight_decay
            .iter()
            .any(|pattern| name.contains(pattern.as_str()))
    }
}

impl Optimizer for LarsOptimizer {
    fn name(&self) -> &str {
        "lars"
    }

    fn zero_grad(&mut self) {}

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_count += 1;

        for (name, var) in named_vars(&self.var_map) {
            let Some(grad) = grads.get(&var) else {
                continue;
            };
            let excluded = self.is_excluded(&name);

            let grad = if excluded || self.weight_decay == 0.0 {
                grad.clone()
            } else {
                (grad + (var.as_tensor() * self.weight_decay)?)?
            };

            let local_lr = if excluded {
                1.0
            } else {
                let w_norm = var.as_tensor().sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
                let g_norm = grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
                let (w_norm, g_norm) = (w_norm.sqrt(), g_norm.sqrt());
                if w_norm > 0.0 && g_norm > 0.0 {
                    self.eta * w_norm / g_norm
                } else {
                    1.0
                }
            };

            let scaled = (grad * (self.learning_rate * local_lr))?;
            let update = match self.momentum_buffers.get(&name) {
                Some(buf) => ((buf * self.momentum)? + scaled)?,
                None => scaled,
            };
            var.set(&(var.as_tensor() - &update)?)?;
            self.momentum_buffers.insert(name, update);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn step_count(&self) -> usize {
        self.step_count
    }

    fn state_dict(&self) -> Result<OptimizerStateDict> {
        let mut tensors = HashMap::new();
        for (name, t) in &self.momentum_buffers {
            tensors.insert(format!("{name}.momentum"), TensorState::from_tensor(t)?);
        }
        let mut hyperparameters = HashMap::new();
        hyperparameters.insert("momentum".to_string(), self.momentum);
        hyperparameters.insert("weight_decay".to_string(), self.weight_decay);
        hyperparameters.insert("eta".to_string(), self.eta);
        Ok(OptimizerStateDict {
            optimizer_type: self.name().to_string(),
            step_count: self.step_count,
            learning_rate: self.learning_rate,
            tensors,
            hyperparameters,
        })
    }

    fn load_state_dict(&mut self, state: OptimizerStateDict) -> Result<()> {
        if state.optimizer_type != self.name() {
            return Err(Error::config(format!(
                "checkpoint holds '{}' state, expected '{}'",
                state.optimizer_type,
                self.name()
            )));
        }
        self.step_count = state.step_count;
        self.learning_rate = state.learning_rate;
        let device = parameter_device(&self.var_map);
        self.momentum_buffers.clear();
        for (key, tensor_state) in &state.tensors {
            if let Some(name) = key.strip_suffix(".momentum") {
                self.momentum_buffers
                    .insert(name.to_string(), tensor_state.to_tensor(&device)?);
            }
        }
        Ok(())
    }
}

/// Build the configured optimizer over the model's parameters.
///
/// The LARS path derives its rate with square-root batch scaling
/// (`0.075 * sqrt(batch_size)`) instead of using the configured rate.
pub fn build_optimizer(config: &RunConfig, var_map: VarMap) -> Result<Box<dyn Optimizer>> {
    match config.optimizer.as_str() {
        "adam" => Ok(Box::new(AdamOptimizer::new(var_map, config.learning_rate))),
        "lars" => {
            let learning_rate = 0.075 * (config.batch_size as f64).sqrt();
            Ok(Box::new(LarsOptimizer::new(
                var_map,
                learning_rate,
                config.weight_decay,
            )))
        }
        other => Err(Error::config(format!("unknown optimizer '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarBuilder;

    fn quadratic_setup() -> (VarMap, Var) {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        // materialize one named parameter
        vb.get_with_hints((2,), "weight", candle_nn::init::Init::Const(2.0))
            .unwrap();
        let var = var_map.data().lock().unwrap().get("weight").unwrap().clone();
        (var_map, var)
    }

    fn loss_of(var: &Var) -> Tensor {
        var.as_tensor().sqr().unwrap().sum_all().unwrap()
    }

    #[test]
    fn test_adam_descends_quadratic() {
        let (var_map, var) = quadratic_setup();
        let mut opt = AdamOptimizer::new(var_map, 0.1);
        let initial = loss_of(&var).to_scalar::<f32>().unwrap();
        for _ in 0..20 {
            let loss = loss_of(&var);
            let grads = loss.backward().unwrap();
            opt.step(&grads).unwrap();
        }
        let final_loss = loss_of(&var).to_scalar::<f32>().unwrap();
        assert!(final_loss < initial);
        assert_eq!(opt.step_count(), 20);
    }

    #[test]
    fn test_lars_descends_quadratic() {
        let (var_map, var) = quadratic_setup();
        let mut opt = LarsOptimizer::new(var_map, 0.5, 1e-6);
        let initial = loss_of(&var).to_scalar::<f32>().unwrap();
        for _ in 0..20 {
            let loss = loss_of(&var);
            let grads = loss.backward().unwrap();
            opt.step(&grads).unwrap();
        }
        let final_loss = loss_of(&var).to_scalar::<f32>().unwrap();
        assert!(final_loss < initial);
    }

    #[test]
    fn test_state_dict_roundtrip() {
        let (var_map, var) = quadratic_setup();
        let mut opt = AdamOptimizer::new(var_map.clone(), 0.01);
        let grads = loss_of(&var).backward().unwrap();
        opt.step(&grads).unwrap();

        let bytes = opt.state_dict().unwrap().to_bytes().unwrap();
        let restored_state = OptimizerStateDict::from_bytes(&bytes).unwrap();

        let mut fresh = AdamOptimizer::new(var_map, 0.5);
        fresh.load_state_dict(restored_state).unwrap();
        assert_eq!(fresh.step_count(), 1);
        assert_eq!(fresh.learning_rate(), 0.01);
        assert!(fresh.first_moments.contains_key("weight"));
    }

    #[test]
    fn test_mismatched_state_rejected() {
        let (var_map, _) = quadratic_setup();
        let mut adam = AdamOptimizer::new(var_map.clone(), 0.01);
        let lars_state = LarsOptimizer::new(var_map, 0.1, 0.0).state_dict().unwrap();
        assert!(adam.load_state_dict(lars_state).is_err());
    }

    #[test]
    fn test_factory_respects_config() {
        let config = RunConfig {
            optimizer: "lars".to_string(),
            batch_size: 64,
            ..RunConfig::default()
        };
        let opt = build_optimizer(&config, VarMap::new()).unwrap();
        assert_eq!(opt.name(), "lars");
        approx::assert_abs_diff_eq!(opt.learning_rate(), 0.6, epsilon = 1e-9);
    }

    #[test]
    fn test_weight_decay_exclusion_patterns() {
        let opt = LarsOptimizer::new(VarMap::new(), 0.1, 1e-6);
        assert!(opt.is_excluded("encoder.conv0.bias"));
        assert!(opt.is_excluded("encoder.batch_norm.weight"));
        assert!(!opt.is_excluded("encoder.conv0.weight"));
    }
}
