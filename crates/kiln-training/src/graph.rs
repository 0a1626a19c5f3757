//! Computation assembly.
//!
//! [`GraphBuilder`] composes the five plugins into two computations:
//!
//! * [`TrainingComputation`]: a learning-rate input slot, a single-step update op that
//!   dequeues one batch, a `total_loss` handle and the objective's metrics;
//! * [`InferenceComputation`]: single raw input to model output, in the `Validation`
//!   scope. It only ever sees the parameters read-only and has no queue to consume.

use crate::error::{TrainingError, TrainingResult};
use crate::feeder::BatchQueue;
use crate::hypes::Hypes;
use crate::plugin::{Architecture, MetricFn, Objective, Optimizer};
use crate::registry::PluginSet;
use crate::tensor::{Tensor, Variables};
use std::sync::Arc;
use tracing::debug;

pub const TRAINING_SCOPE: &str = "Training";
pub const VALIDATION_SCOPE: &str = "Validation";
pub const TOTAL_LOSS: &str = "total_loss";
pub const LEARNING_RATE: &str = "learning_rate";

/// Naming scope of a computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    name: String,
}

impl Scope {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn qualify(&self, leaf: &str) -> String {
        format!("{}/{leaf}", self.name)
    }
}

/// Write access to the variable store during graph construction.
///
/// Only the training build hands one out; creating a name twice is an error.
pub struct VariableScope<'a> {
    variables: &'a mut Variables,
    created: Vec<String>,
}

impl<'a> VariableScope<'a> {
    pub fn new(variables: &'a mut Variables) -> Self {
        Self { variables, created: Vec::new() }
    }

    pub fn create(&mut self, name: &str, initial: Tensor) -> TrainingResult<()> {
        if self.variables.contains(name) {
            return Err(TrainingError::backend(format!("variable {name} already exists")));
        }
        self.variables.insert(name, initial);
        self.created.push(name.to_string());
        Ok(())
    }

    #[must_use]
    pub fn created(&self) -> &[String] {
        &self.created
    }
}

/// Feed slot for the per-step learning rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearningRateInput {
    name: String,
}

impl LearningRateInput {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossHandle {
    name: String,
}

impl LossHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Values a single update leaves behind for loss and metric fetches.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub step: u64,
    pub loss: f64,
    pub output: Tensor,
    pub labels: Tensor,
}

#[derive(Clone)]
pub struct MetricHandle {
    name: String,
    compute: MetricFn,
}

impl MetricHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn evaluate(&self, step: &StepOutput) -> f64 {
        (self.compute)(&step.output, &step.labels)
    }
}

impl std::fmt::Debug for MetricHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricHandle").field("name", &self.name).finish_non_exhaustive()
    }
}

/// One optimization step: dequeue, forward, loss, backward, apply.
pub struct UpdateOp {
    hypes: Arc<Hypes>,
    queue: Arc<BatchQueue>,
    architecture: Arc<dyn Architecture>,
    objective: Arc<dyn Objective>,
    optimizer: Arc<dyn Optimizer>,
}

impl UpdateOp {
    /// Blocks on the queue until a batch arrives.
    ///
    /// A non-finite loss or gradient aborts before any parameter is touched.
    pub fn run(&self, variables: &mut Variables, step: u64, learning_rate: f64) -> TrainingResult<StepOutput> {
        let batch = self.queue.dequeue()?;
        let forward = self.architecture.inference(&self.hypes, variables, &batch.inputs)?;
        let loss = self.objective.loss(&self.hypes, &forward.output, &batch.labels)?;
        if !loss.total_loss.is_finite() {
            return Err(TrainingError::NumericalDivergence { step, loss: f64::from(loss.total_loss) });
        }

        let gradients =
            self.architecture.backward(&self.hypes, variables, &batch.inputs, &forward, &loss.grad)?;
        if let Some((name, _)) = gradients.iter().find(|(_, g)| !g.all_finite()) {
            debug!(step, variable = name, "Non-finite gradient");
            return Err(TrainingError::NumericalDivergence { step, loss: f64::from(loss.total_loss) });
        }
        self.optimizer.apply_gradients(&self.hypes, variables, &gradients, learning_rate)?;

        Ok(StepOutput {
            step,
            loss: f64::from(loss.total_loss),
            output: forward.output,
            labels: batch.labels,
        })
    }
}

pub struct TrainingComputation {
    pub scope: Scope,
    pub learning_rate: LearningRateInput,
    pub update: UpdateOp,
    pub loss: LossHandle,
    pub metrics: Vec<MetricHandle>,
}

impl TrainingComputation {
    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(MetricHandle::name)
    }
}

pub struct InferenceComputation {
    pub scope: Scope,
    hypes: Arc<Hypes>,
    architecture: Arc<dyn Architecture>,
}

impl InferenceComputation {
    /// Run the model on one unbatched example; the output keeps its batch axis of 1.
    pub fn run(&self, variables: &Variables, raw_input: &Tensor) -> TrainingResult<Tensor> {
        let input = raw_input.clone().expand_dims0();
        let forward = self.architecture.inference(&self.hypes, variables, &input)?;
        Ok(forward.output)
    }
}

pub struct GraphBuilder<'a> {
    hypes: &'a Arc<Hypes>,
    plugins: &'a PluginSet,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(hypes: &'a Arc<Hypes>, plugins: &'a PluginSet) -> Self {
        Self { hypes, plugins }
    }

    /// Create the model parameters in `variables` and wire the update op to `queue`.
    pub fn build_training_graph(
        &self,
        queue: Arc<BatchQueue>,
        variables: &mut Variables,
    ) -> TrainingResult<TrainingComputation> {
        let scope = Scope::new(TRAINING_SCOPE);
        let mut vars = VariableScope::new(variables);
        self.plugins.architecture.init_variables(self.hypes, &mut vars)?;
        if vars.created().is_empty() {
            return Err(TrainingError::backend("architecture created no trainable variables"));
        }
        debug!(scope = scope.name(), variables = ?vars.created(), "Built training computation");

        let metrics = self
            .plugins
            .objective
            .metrics(self.hypes)
            .into_iter()
            .map(|(name, compute)| MetricHandle { name, compute })
            .collect();

        Ok(TrainingComputation {
            scope,
            learning_rate: LearningRateInput { name: LEARNING_RATE.to_string() },
            update: UpdateOp {
                hypes: self.hypes.clone(),
                queue,
                architecture: self.plugins.architecture.clone(),
                objective: self.plugins.objective.clone(),
                optimizer: self.plugins.optimizer.clone(),
            },
            loss: LossHandle { name: TOTAL_LOSS.to_string() },
            metrics,
        })
    }

    pub fn build_inference_graph(&self) -> InferenceComputation {
        InferenceComputation {
            scope: Scope::new(VALIDATION_SCOPE),
            hypes: self.hypes.clone(),
            architecture: self.plugins.architecture.clone(),
        }
    }
}
