//! `sgd`: plain gradient descent with a step-indexed learning-rate schedule.
//!
//! ```toml
//! plugin = "sgd"
//!
//! [params]
//! learning_rate = 0.05     # falls back to solver.learning_rate, then 0.01
//! schedule = "exponential" # constant | step | exponential
//! decay_rate = 0.5
//! decay_steps = 100
//! ```

use kiln_training::{
    Gradients, Hypes, Optimizer, PluginDescriptor, PluginRole, TrainingError, TrainingResult, Variables,
};
use serde::Deserialize;

pub const ID: &str = "sgd";

const DEFAULT_LEARNING_RATE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    #[default]
    Constant,
    /// `lr × decay_rate ^ floor(step / decay_steps)`
    Step,
    /// `lr × decay_rate ^ (step / decay_steps)`
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SgdParams {
    pub learning_rate: Option<f64>,
    pub schedule: Schedule,
    pub decay_rate: f64,
    pub decay_steps: u64,
}

impl Default for SgdParams {
    fn default() -> Self {
        Self { learning_rate: None, schedule: Schedule::Constant, decay_rate: 0.1, decay_steps: 1000 }
    }
}

pub struct Sgd {
    params: SgdParams,
}

impl Sgd {
    pub fn from_descriptor(descriptor: &PluginDescriptor) -> TrainingResult<Self> {
        let params: SgdParams = descriptor.params(PluginRole::Optimizer)?;
        if params.decay_steps == 0 {
            return Err(TrainingError::plugin(PluginRole::Optimizer, "decay_steps must be at least 1"));
        }
        Ok(Self { params })
    }
}

impl Optimizer for Sgd {
    fn get_learning_rate(&self, hypes: &Hypes, step: u64) -> f64 {
        let base = self
            .params
            .learning_rate
            .or_else(|| hypes.get_f64("solver.learning_rate"))
            .unwrap_or(DEFAULT_LEARNING_RATE);
        #[allow(clippy::cast_precision_loss)]
        let exponent = match self.params.schedule {
            Schedule::Constant => return base,
            Schedule::Step => (step / self.params.decay_steps) as f64,
            Schedule::Exponential => step as f64 / self.params.decay_steps as f64,
        };
        base * self.params.decay_rate.powf(exponent)
    }

    fn apply_gradients(
        &self,
        _hypes: &Hypes,
        variables: &mut Variables,
        gradients: &Gradients,
        learning_rate: f64,
    ) -> TrainingResult<()> {
        let lr = learning_rate as f32;
        for (name, grad) in gradients.iter() {
            let var = variables.get_mut(name)?;
            if var.shape() != grad.shape() {
                return Err(TrainingError::backend(format!(
                    "gradient for {name} has shape {:?}, variable has {:?}",
                    grad.shape(),
                    var.shape()
                )));
            }
            for (v, g) in var.data_mut().iter_mut().zip(grad.data()) {
                *v -= lr * g;
            }
        }
        Ok(())
    }
}
