//! Plugin contract.
//!
//! A model is assembled from five independently swappable roles. Each role is a trait;
//! concrete implementations are registered under stable identifiers in a
//! [`PluginRegistry`](crate::registry::PluginRegistry) and selected by the plugin files a
//! hypes document points at.

use crate::error::TrainingResult;
use crate::feeder::{BatchQueue, Coordinator};
use crate::graph::VariableScope;
use crate::hypes::Hypes;
use crate::tensor::{Tensor, Variables};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginRole {
    Input,
    Architecture,
    Objective,
    Optimizer,
    Evaluator,
}

impl PluginRole {
    pub const ALL: [Self; 5] =
        [Self::Input, Self::Architecture, Self::Objective, Self::Optimizer, Self::Evaluator];

    /// Key of the plugin file under the `model` section of the hypes.
    #[must_use]
    pub fn config_key(self) -> &'static str {
        match self {
            Self::Input => "input_file",
            Self::Architecture => "architecture_file",
            Self::Objective => "objective_file",
            Self::Optimizer => "optimizer_file",
            Self::Evaluator => "evaluator_file",
        }
    }
}

impl std::fmt::Display for PluginRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Input => "input",
            Self::Architecture => "architecture",
            Self::Objective => "objective",
            Self::Optimizer => "optimizer",
            Self::Evaluator => "evaluator",
        };
        f.write_str(name)
    }
}

/// Dataset split a queue or evaluation reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Val,
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Train => "train",
            Self::Val => "val",
        })
    }
}

/// One mini-batch: `inputs` is `[batch, features...]`, `labels` is `[batch, targets...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Tensor,
    pub labels: Tensor,
}

/// Source of batches driven by a feeder worker.
pub trait BatchProducer: Send + 'static {
    /// Produce the next batch, or `None` once the source is exhausted.
    fn next_batch(&mut self) -> TrainingResult<Option<Batch>>;
}

/// Optional data acquisition capability of an input plugin.
pub trait DatasetDownload: Send + Sync {
    fn maybe_download_and_extract(&self, hypes: &Hypes, data_dir: &Path) -> TrainingResult<()>;
}

pub trait InputSource: Send + Sync {
    /// Create the bounded queue training steps dequeue from.
    fn create_queues(&self, _hypes: &Hypes, split: Split, capacity: usize) -> TrainingResult<BatchQueue> {
        Ok(BatchQueue::new(split, capacity))
    }

    /// Start the workers that fill `queue`.
    ///
    /// Workers must be spawned through `coordinator` so that they observe the shared
    /// cancellation token and are joined at shutdown. `start_step` is the first step the
    /// loop will run; a deterministic source skips the batches of steps before it so a
    /// resumed run sees the same stream as an uninterrupted one.
    fn start_enqueuing_threads(
        &self,
        hypes: &Hypes,
        queue: &BatchQueue,
        split: Split,
        start_step: u64,
        coordinator: &mut Coordinator,
    ) -> TrainingResult<()>;

    /// The download hook, if this input source has one.
    fn download(&self) -> Option<&dyn DatasetDownload> {
        None
    }
}

/// Result of a forward pass. `cache` holds whatever the backward pass needs.
#[derive(Debug, Clone)]
pub struct Forward {
    pub output: Tensor,
    pub cache: Vec<Tensor>,
}

/// Gradients keyed by variable name.
pub type Gradients = Variables;

pub trait Architecture: Send + Sync {
    /// Create the trainable variables of the model.
    fn init_variables(&self, hypes: &Hypes, scope: &mut VariableScope<'_>) -> TrainingResult<()>;

    /// Forward pass over a batch.
    fn inference(&self, hypes: &Hypes, variables: &Variables, input: &Tensor) -> TrainingResult<Forward>;

    /// Gradients of the loss with respect to every variable, given `d loss / d output`.
    fn backward(
        &self,
        hypes: &Hypes,
        variables: &Variables,
        input: &Tensor,
        forward: &Forward,
        grad_output: &Tensor,
    ) -> TrainingResult<Gradients>;
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub total_loss: f32,
    /// `d total_loss / d output`, same shape as the model output.
    pub grad: Tensor,
}

/// Lightweight metric evaluated on the most recent training batch: `(output, labels)`.
pub type MetricFn = Arc<dyn Fn(&Tensor, &Tensor) -> f64 + Send + Sync>;

/// Runs the inference computation on a single raw (unbatched) input.
pub trait InferenceRunner {
    fn infer(&mut self, input: &Tensor) -> TrainingResult<Tensor>;
}

/// Evaluation output as produced by a plugin, before normalization.
#[derive(Debug, Clone, Default)]
pub struct RawEvaluation {
    pub scalars: Vec<(String, f64)>,
    pub images: Vec<(String, Tensor)>,
}

pub trait Evaluator: Send + Sync {
    fn evaluate(&self, hypes: &Hypes, runner: &mut dyn InferenceRunner) -> TrainingResult<RawEvaluation>;
}

/// The objective contributes the loss to the training computation and can also serve as
/// the evaluator.
pub trait Objective: Evaluator {
    fn loss(&self, hypes: &Hypes, output: &Tensor, labels: &Tensor) -> TrainingResult<LossOutput>;

    fn metrics(&self, _hypes: &Hypes) -> Vec<(String, MetricFn)> {
        Vec::new()
    }
}

pub trait Optimizer: Send + Sync {
    fn get_learning_rate(&self, hypes: &Hypes, step: u64) -> f64;

    fn apply_gradients(
        &self,
        hypes: &Hypes,
        variables: &mut Variables,
        gradients: &Gradients,
        learning_rate: f64,
    ) -> TrainingResult<()>;
}
