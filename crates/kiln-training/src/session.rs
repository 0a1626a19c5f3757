//! Execution session and its lifecycle.

use crate::checkpoint::CheckpointController;
use crate::error::{TrainingError, TrainingResult};
use crate::feeder::{BatchQueue, Coordinator, ShutdownReport};
use crate::graph::{InferenceComputation, StepOutput, TrainingComputation};
use crate::hypes::Hypes;
use crate::layout::TrainingLayout;
use crate::plugin::InputSource;
use crate::settings::Settings;
use crate::summary::SummaryWriter;
use crate::tensor::{Tensor, Variables};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs computations against the parameter store.
///
/// Only the scheduler thread holds a session; inference takes `&self` and cannot write
/// parameters.
pub trait ExecutionSession: Send {
    /// One update, fed with `learning_rate`.
    fn run_update(&mut self, graph: &TrainingComputation, step: u64, learning_rate: f64) -> TrainingResult<()>;

    /// One update, returning the loss computed in the same pass.
    fn run_update_with_loss(
        &mut self,
        graph: &TrainingComputation,
        step: u64,
        learning_rate: f64,
    ) -> TrainingResult<f64>;

    /// Metric values over the batch of the most recent update, in graph order.
    fn run_metrics(&self, graph: &TrainingComputation) -> TrainingResult<Vec<(String, f64)>>;

    fn run_inference(&self, graph: &InferenceComputation, input: &Tensor) -> TrainingResult<Tensor>;

    fn variables(&self) -> &Variables;

    /// Replace every parameter; names and shapes must match the graph's.
    fn restore(&mut self, variables: Variables) -> TrainingResult<()>;
}

/// In-process session over a [`Variables`] store.
#[derive(Debug, Default)]
pub struct LocalSession {
    variables: Variables,
    last: Option<StepOutput>,
}

impl LocalSession {
    #[must_use]
    pub fn new(variables: Variables) -> Self {
        Self { variables, last: None }
    }
}

impl ExecutionSession for LocalSession {
    fn run_update(&mut self, graph: &TrainingComputation, step: u64, learning_rate: f64) -> TrainingResult<()> {
        self.run_update_with_loss(graph, step, learning_rate).map(|_| ())
    }

    fn run_update_with_loss(
        &mut self,
        graph: &TrainingComputation,
        step: u64,
        learning_rate: f64,
    ) -> TrainingResult<f64> {
        let output = graph.update.run(&mut self.variables, step, learning_rate)?;
        let loss = output.loss;
        self.last = Some(output);
        Ok(loss)
    }

    fn run_metrics(&self, graph: &TrainingComputation) -> TrainingResult<Vec<(String, f64)>> {
        let last = self
            .last
            .as_ref()
            .ok_or_else(|| TrainingError::backend("metrics requested before any update ran"))?;
        Ok(graph.metrics.iter().map(|m| (m.name().to_string(), m.evaluate(last))).collect())
    }

    fn run_inference(&self, graph: &InferenceComputation, input: &Tensor) -> TrainingResult<Tensor> {
        graph.run(&self.variables, input)
    }

    fn variables(&self) -> &Variables {
        &self.variables
    }

    fn restore(&mut self, variables: Variables) -> TrainingResult<()> {
        self.variables.ensure_compatible(&variables)?;
        self.variables = variables;
        self.last = None;
        Ok(())
    }
}

/// Everything the scheduler borrows for the duration of the loop.
pub struct ExecutionContext {
    pub training: TrainingComputation,
    pub inference: InferenceComputation,
    pub session: Box<dyn ExecutionSession>,
    pub checkpoints: CheckpointController,
    pub summaries: SummaryWriter,
    stop: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        training: TrainingComputation,
        inference: InferenceComputation,
        session: Box<dyn ExecutionSession>,
        checkpoints: CheckpointController,
        summaries: SummaryWriter,
        stop: CancellationToken,
    ) -> Self {
        Self { training, inference, session, checkpoints, summaries, stop }
    }

    /// Token cancelled by an external stop request or by shutdown.
    #[must_use]
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }
}

/// Owns the execution context and the feeder coordinator of one run.
pub struct SessionManager {
    context: ExecutionContext,
    coordinator: Coordinator,
    queue: Arc<BatchQueue>,
    shutdown_timeout: Duration,
}

impl SessionManager {
    /// Allocate the session, checkpoint writer, summary writer and coordinator.
    ///
    /// `stop` is the caller's cancellation token; the coordinator derives its own child.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        hypes: &Hypes,
        settings: &Settings,
        training: TrainingComputation,
        inference: InferenceComputation,
        variables: Variables,
        queue: Arc<BatchQueue>,
        stop: &CancellationToken,
        runtime: Handle,
    ) -> TrainingResult<Self> {
        let layout = TrainingLayout::new(hypes.dirs.output_dir.clone());
        let summaries = SummaryWriter::create(&layout.events_path())?;
        let checkpoints = CheckpointController::new(layout.root(), settings.max_checkpoints_to_keep);
        let coordinator = Coordinator::new(stop, runtime);

        debug!(output_dir = %layout.root().display(), "Session started");
        let context = ExecutionContext::new(
            training,
            inference,
            Box::new(LocalSession::new(variables)),
            checkpoints,
            summaries,
            coordinator.token(),
        );
        Ok(Self {
            context,
            coordinator,
            queue,
            shutdown_timeout: Duration::from_secs(settings.shutdown_timeout_secs),
        })
    }

    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.context
    }

    /// Restore the newest checkpoint into the session.
    ///
    /// Returns the checkpointed step, or `None` when there is nothing to restore.
    pub fn restore_latest(&mut self) -> TrainingResult<Option<u64>> {
        match self.context.checkpoints.load() {
            Ok(restored) => {
                self.context.session.restore(restored.variables)?;
                Ok(Some(restored.step))
            }
            Err(TrainingError::CheckpointNotFound(path)) => {
                warn!("No checkpoint found in {}, starting from step 0", path.display());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Start the input plugin's workers at the batch of `start_step`, then seal the queue.
    pub fn start_feeding(&mut self, hypes: &Hypes, input: &dyn InputSource, start_step: u64) -> TrainingResult<()> {
        input.start_enqueuing_threads(hypes, &self.queue, self.queue.split(), start_step, &mut self.coordinator)?;
        self.queue.seal();
        info!(workers = self.coordinator.worker_count(), start_step, "Started {} feeder", self.queue.split());
        Ok(())
    }

    /// Run `body` on a blocking thread, then shut the feeder down whatever the outcome.
    pub async fn run<T, F>(self, body: F) -> (TrainingResult<T>, ShutdownReport)
    where
        T: Send + 'static,
        F: FnOnce(&mut ExecutionContext) -> TrainingResult<T> + Send + 'static,
    {
        let Self { mut context, coordinator, queue, shutdown_timeout } = self;

        let result = tokio::task::spawn_blocking(move || body(&mut context))
            .await
            .unwrap_or_else(|e| Err(TrainingError::backend(format!("training thread failed: {e}"))));

        let report = shutdown(coordinator, &queue, shutdown_timeout).await;
        (result, report)
    }

    /// Stop and join the feeder without running anything.
    pub async fn shutdown(self) -> ShutdownReport {
        shutdown(self.coordinator, &self.queue, self.shutdown_timeout).await
    }
}

async fn shutdown(coordinator: Coordinator, queue: &BatchQueue, timeout: Duration) -> ShutdownReport {
    coordinator.request_stop();
    queue.close();
    let report = coordinator.join(timeout).await;
    if report.is_clean() {
        debug!(joined = report.joined, "Feeder stopped");
    } else {
        warn!(
            timed_out = ?report.timed_out,
            failed = ?report.failed,
            "Feeder did not shut down cleanly"
        );
    }
    report
}
