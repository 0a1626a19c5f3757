//! Pluggable training orchestration.
//!
//! A run is described by a hypes document naming five plugin files (input,
//! architecture, objective, optimizer and optionally evaluator). The orchestrator
//! resolves them through a [`PluginRegistry`], prepares the training folder, builds a
//! training and an inference computation, and drives the step loop with its display,
//! summary, evaluation and checkpoint cadences.

pub mod cadence;
pub mod checkpoint;
pub mod error;
pub mod evaluation;
pub mod feeder;
pub mod folder;
pub mod graph;
pub mod hypes;
pub mod layout;
pub mod logging;
pub mod plugin;
pub mod progress;
pub mod provision;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod summary;
pub mod tensor;
pub mod train;

#[cfg(test)]
mod test_support;

pub use cadence::{Cadence, CadenceTable, StepActivities};
pub use checkpoint::{CheckpointController, CheckpointIndex, RestoredCheckpoint};
pub use error::{ErrorKind, TrainingError, TrainingResult};
pub use evaluation::{EvaluationDriver, EvaluationResult};
pub use feeder::{BatchQueue, Coordinator, ShutdownReport};
pub use folder::initialize_training_folder;
pub use graph::{GraphBuilder, InferenceComputation, TrainingComputation, VariableScope};
pub use hypes::{Hypes, HypesFile, RunNaming};
pub use layout::TrainingLayout;
pub use logging::LogSink;
pub use plugin::{
    Architecture, Batch, BatchProducer, DatasetDownload, Evaluator, Forward, Gradients, InferenceRunner,
    InputSource, LossOutput, MetricFn, Objective, Optimizer, PluginRole, RawEvaluation, Split,
};
pub use progress::{ProgressEvent, ProgressSink, TracingProgressSink};
pub use provision::maybe_download_and_extract;
pub use registry::{PluginDescriptor, PluginRegistry, PluginSet};
pub use scheduler::{LoopOutcome, TrainingLoopScheduler};
pub use session::{ExecutionContext, ExecutionSession, LocalSession, SessionManager};
pub use settings::Settings;
pub use summary::{SummaryEvent, SummaryValue, SummaryWriter, read_events};
pub use tensor::{Tensor, Variables};
pub use train::{PreparedRun, TrainOptions, TrainingReport, continue_training, do_training, prepare_run, train};
