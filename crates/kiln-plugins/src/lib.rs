//! Reference plugins for kiln: a small dense-regression toolkit.
//!
//! | role         | id                 |
//! |--------------|--------------------|
//! | input        | `regression_jsonl` |
//! | architecture | `linear`, `mlp`    |
//! | objective    | `mse`              |
//! | optimizer    | `sgd`              |
//! | evaluator    | `regression_eval`  |

pub mod data;
pub mod eval;
pub mod input;
pub mod linear;
pub mod mlp;
pub mod mse;
pub mod ops;
pub mod scoring;
pub mod sgd;

use kiln_training::PluginRegistry;
use std::sync::Arc;

/// Register every built-in plugin under its identifier.
pub fn register_builtin(registry: &mut PluginRegistry) {
    registry.register_input(input::ID, |d| Ok(Arc::new(input::RegressionJsonl::from_descriptor(d)?)));
    registry.register_architecture(linear::ID, |_| Ok(Arc::new(linear::Linear)));
    registry.register_architecture(mlp::ID, |d| Ok(Arc::new(mlp::Mlp::from_descriptor(d)?)));
    registry.register_objective(mse::ID, |d| Ok(Arc::new(mse::MeanSquaredError::from_descriptor(d)?)));
    registry.register_optimizer(sgd::ID, |d| Ok(Arc::new(sgd::Sgd::from_descriptor(d)?)));
    registry.register_evaluator(eval::ID, |d| Ok(Arc::new(eval::RegressionEval::from_descriptor(d)?)));
}

#[must_use]
pub fn builtin_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    register_builtin(&mut registry);
    registry
}
