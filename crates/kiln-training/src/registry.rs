//! Plugin resolution.
//!
//! A plugin file is a small TOML descriptor:
//!
//! ```toml
//! plugin = "sgd"
//!
//! [params]
//! learning_rate = 0.05
//! schedule = "exponential"
//! ```
//!
//! `plugin` names a factory registered for the file's role; `params` is handed to that
//! factory. Resolution never substitutes a default: a missing file, a malformed
//! descriptor or an unknown identifier fails the whole run.

use crate::error::{TrainingError, TrainingResult};
use crate::hypes::Hypes;
use crate::plugin::{Architecture, Evaluator, InputSource, Objective, Optimizer, PluginRole};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Registered identifier of the implementation.
    pub plugin: String,
    #[serde(default)]
    pub params: toml::Table,
}

impl PluginDescriptor {
    #[must_use]
    pub fn new(plugin: impl Into<String>) -> Self {
        Self { plugin: plugin.into(), params: toml::Table::new() }
    }

    pub fn from_path(role: PluginRole, path: &Path) -> TrainingResult<Self> {
        if !path.is_file() {
            return Err(TrainingError::plugin(
                role,
                format!("{} does not exist: {}", role.config_key(), path.display()),
            ));
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrainingError::plugin(role, format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| {
            TrainingError::plugin(role, format!("malformed plugin file {}: {e}", path.display()))
        })
    }

    /// Deserialize `params` into a plugin's own parameter type.
    pub fn params<T: DeserializeOwned>(&self, role: PluginRole) -> TrainingResult<T> {
        toml::Value::Table(self.params.clone()).try_into().map_err(|e| {
            TrainingError::plugin(role, format!("invalid params for {}: {e}", self.plugin))
        })
    }
}

type Factory<T> = Box<dyn Fn(&PluginDescriptor) -> TrainingResult<Arc<T>> + Send + Sync>;

struct Factories<T: ?Sized> {
    role: PluginRole,
    entries: BTreeMap<String, Factory<T>>,
}

impl<T: ?Sized> Factories<T> {
    fn new(role: PluginRole) -> Self {
        Self { role, entries: BTreeMap::new() }
    }

    fn insert(&mut self, id: &str, factory: Factory<T>) {
        self.entries.insert(id.to_string(), factory);
    }

    fn ids(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    fn build(&self, descriptor: &PluginDescriptor) -> TrainingResult<Arc<T>> {
        let factory = self.entries.get(&descriptor.plugin).ok_or_else(|| {
            TrainingError::plugin(
                self.role,
                format!(
                    "no {} plugin registered as {:?} (known: {})",
                    self.role,
                    descriptor.plugin,
                    self.ids().join(", ")
                ),
            )
        })?;
        factory(descriptor)
    }
}

/// The five plugins of a run.
#[derive(Clone)]
pub struct PluginSet {
    pub input: Arc<dyn InputSource>,
    pub architecture: Arc<dyn Architecture>,
    pub objective: Arc<dyn Objective>,
    pub optimizer: Arc<dyn Optimizer>,
    pub evaluator: Arc<dyn Evaluator>,
}

/// Registered plugin factories, one table per role.
pub struct PluginRegistry {
    inputs: Factories<dyn InputSource>,
    architectures: Factories<dyn Architecture>,
    objectives: Factories<dyn Objective>,
    optimizers: Factories<dyn Optimizer>,
    evaluators: Factories<dyn Evaluator>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            inputs: Factories::new(PluginRole::Input),
            architectures: Factories::new(PluginRole::Architecture),
            objectives: Factories::new(PluginRole::Objective),
            optimizers: Factories::new(PluginRole::Optimizer),
            evaluators: Factories::new(PluginRole::Evaluator),
        }
    }

    pub fn register_input<F>(&mut self, id: &str, factory: F)
    where
        F: Fn(&PluginDescriptor) -> TrainingResult<Arc<dyn InputSource>> + Send + Sync + 'static,
    {
        self.inputs.insert(id, Box::new(factory));
    }

    pub fn register_architecture<F>(&mut self, id: &str, factory: F)
    where
        F: Fn(&PluginDescriptor) -> TrainingResult<Arc<dyn Architecture>> + Send + Sync + 'static,
    {
        self.architectures.insert(id, Box::new(factory));
    }

    pub fn register_objective<F>(&mut self, id: &str, factory: F)
    where
        F: Fn(&PluginDescriptor) -> TrainingResult<Arc<dyn Objective>> + Send + Sync + 'static,
    {
        self.objectives.insert(id, Box::new(factory));
    }

    pub fn register_optimizer<F>(&mut self, id: &str, factory: F)
    where
        F: Fn(&PluginDescriptor) -> TrainingResult<Arc<dyn Optimizer>> + Send + Sync + 'static,
    {
        self.optimizers.insert(id, Box::new(factory));
    }

    pub fn register_evaluator<F>(&mut self, id: &str, factory: F)
    where
        F: Fn(&PluginDescriptor) -> TrainingResult<Arc<dyn Evaluator>> + Send + Sync + 'static,
    {
        self.evaluators.insert(id, Box::new(factory));
    }

    /// Registered identifiers for a role, sorted.
    pub fn ids(&self, role: PluginRole) -> Vec<&str> {
        match role {
            PluginRole::Input => self.inputs.ids(),
            PluginRole::Architecture => self.architectures.ids(),
            PluginRole::Objective => self.objectives.ids(),
            PluginRole::Optimizer => self.optimizers.ids(),
            PluginRole::Evaluator => self.evaluators.ids(),
        }
    }

    /// Resolve every plugin file named in `hypes`.
    ///
    /// All descriptors are read before any plugin is constructed, so a bad path is
    /// reported without side effects. Without an `evaluator_file` the objective doubles
    /// as the evaluator.
    pub fn load_modules_from_hypes(&self, hypes: &Hypes) -> TrainingResult<PluginSet> {
        let descriptor = |role: PluginRole| -> TrainingResult<Option<PluginDescriptor>> {
            hypes
                .plugin_path(role)
                .map(|path| PluginDescriptor::from_path(role, &path))
                .transpose()
        };

        let required = |role: PluginRole| -> TrainingResult<PluginDescriptor> {
            descriptor(role)?
                .ok_or_else(|| TrainingError::plugin(role, format!("model.{} is not set", role.config_key())))
        };

        let input = required(PluginRole::Input)?;
        let architecture = required(PluginRole::Architecture)?;
        let objective = required(PluginRole::Objective)?;
        let optimizer = required(PluginRole::Optimizer)?;
        let evaluator = descriptor(PluginRole::Evaluator)?;

        let objective_plugin = self.objectives.build(&objective)?;
        let evaluator_plugin: Arc<dyn Evaluator> = match &evaluator {
            Some(d) => self.evaluators.build(d)?,
            None => objective_plugin.clone(),
        };

        debug!(
            input = %input.plugin,
            architecture = %architecture.plugin,
            objective = %objective.plugin,
            optimizer = %optimizer.plugin,
            evaluator = %evaluator.as_ref().map_or("<objective>", |d| d.plugin.as_str()),
            "Resolved plugins"
        );

        Ok(PluginSet {
            input: self.inputs.build(&input)?,
            architecture: self.architectures.build(&architecture)?,
            objective: objective_plugin,
            optimizer: self.optimizers.build(&optimizer)?,
            evaluator: evaluator_plugin,
        })
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypes::{HypesFile, RunNaming};
    use crate::test_support::{register_test_plugins, write_test_hypes};
    use tempfile::TempDir;

    #[test]
    fn test_resolves_all_roles_and_falls_back_to_objective_evaluator() {
        let temp = TempDir::new().unwrap();
        let hypes_path = write_test_hypes(temp.path(), 10, serde_json::json!({}));
        let hypes = HypesFile::from_path(&hypes_path)
            .unwrap()
            .resolve(&hypes_path, &RunNaming::default(), |_| None)
            .unwrap();

        let mut registry = PluginRegistry::new();
        register_test_plugins(&mut registry);

        assert!(registry.load_modules_from_hypes(&hypes).is_ok());
    }

    #[test]
    fn test_missing_objective_file_is_resolution_error() {
        let temp = TempDir::new().unwrap();
        let hypes_path = write_test_hypes(temp.path(), 10, serde_json::json!({}));
        std::fs::remove_file(temp.path().join("objective.toml")).unwrap();
        let hypes = HypesFile::from_path(&hypes_path)
            .unwrap()
            .resolve(&hypes_path, &RunNaming::default(), |_| None)
            .unwrap();

        let mut registry = PluginRegistry::new();
        register_test_plugins(&mut registry);

        let err = registry.load_modules_from_hypes(&hypes).err().unwrap();
        assert!(matches!(err, TrainingError::PluginResolution { role: PluginRole::Objective, .. }));
    }

    #[test]
    fn test_unknown_identifier_lists_known_ones() {
        let temp = TempDir::new().unwrap();
        let hypes_path = write_test_hypes(temp.path(), 10, serde_json::json!({}));
        std::fs::write(temp.path().join("solver.toml"), "plugin = \"adamax\"\n").unwrap();
        let hypes = HypesFile::from_path(&hypes_path)
            .unwrap()
            .resolve(&hypes_path, &RunNaming::default(), |_| None)
            .unwrap();

        let mut registry = PluginRegistry::new();
        register_test_plugins(&mut registry);

        let err = registry.load_modules_from_hypes(&hypes).err().unwrap();
        let message = err.to_string();
        assert!(message.contains("adamax"));
        assert!(message.contains("recording"));
    }

    #[test]
    fn test_malformed_descriptor_is_resolution_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("arch.toml");
        std::fs::write(&path, "plugin = [1, 2\n").unwrap();

        let err = PluginDescriptor::from_path(PluginRole::Architecture, &path).unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn test_params_deserialize_into_plugin_type() {
        #[derive(Deserialize)]
        struct Params {
            hidden: usize,
        }
        let descriptor: PluginDescriptor = toml::from_str("plugin = \"mlp\"\n[params]\nhidden = 8\n").unwrap();
        let params: Params = descriptor.params(PluginRole::Architecture).unwrap();
        assert_eq!(params.hidden, 8);
    }
}
