//! Tiny deterministic plugins and fixtures for unit tests.

use crate::checkpoint::CheckpointController;
use crate::error::TrainingResult;
use crate::feeder::{BatchQueue, Coordinator};
use crate::graph::{GraphBuilder, VariableScope};
use crate::hypes::{Hypes, HypesFile, RunNaming};
use crate::layout::TrainingLayout;
use crate::plugin::{
    Architecture, Batch, BatchProducer, Evaluator, Forward, Gradients, InferenceRunner, InputSource,
    LossOutput, MetricFn, Objective, Optimizer, RawEvaluation, Split,
};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::registry::{PluginRegistry, PluginSet};
use crate::scheduler::{LoopOutcome, TrainingLoopScheduler};
use crate::session::{ExecutionContext, LocalSession};
use crate::settings::Settings;
use crate::summary::SummaryWriter;
use crate::tensor::{Tensor, Variables};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn pair(x: f32, y: f32) -> Batch {
    Batch {
        inputs: Tensor::new(vec![1, 1], vec![x]).unwrap(),
        labels: Tensor::new(vec![1, 1], vec![y]).unwrap(),
    }
}

struct ConstantProducer;

impl BatchProducer for ConstantProducer {
    fn next_batch(&mut self) -> TrainingResult<Option<Batch>> {
        Ok(Some(pair(1.0, 2.0)))
    }
}

/// Feeds `x = 1, y = 2` forever from one worker.
pub struct ConstantInput;

impl InputSource for ConstantInput {
    fn start_enqueuing_threads(
        &self,
        _hypes: &Hypes,
        queue: &BatchQueue,
        split: Split,
        _start_step: u64,
        coordinator: &mut Coordinator,
    ) -> TrainingResult<()> {
        coordinator.spawn_producer(format!("constant-{split}"), queue, Box::new(ConstantProducer))
    }
}

/// `y = w * x` with a single weight `scalar/w`.
pub struct ScalarModel;

impl Architecture for ScalarModel {
    fn init_variables(&self, _hypes: &Hypes, scope: &mut VariableScope<'_>) -> TrainingResult<()> {
        scope.create("scalar/w", Tensor::zeros(vec![1, 1]))
    }

    fn inference(&self, _hypes: &Hypes, variables: &Variables, input: &Tensor) -> TrainingResult<Forward> {
        let w = variables.get("scalar/w")?.data()[0];
        let data = input.data().iter().map(|x| x * w).collect();
        Ok(Forward { output: Tensor::new(input.shape().to_vec(), data)?, cache: Vec::new() })
    }

    fn backward(
        &self,
        _hypes: &Hypes,
        _variables: &Variables,
        input: &Tensor,
        _forward: &Forward,
        grad_output: &Tensor,
    ) -> TrainingResult<Gradients> {
        let dw: f32 = input.data().iter().zip(grad_output.data()).map(|(x, g)| x * g).sum();
        let mut grads = Gradients::new();
        grads.insert("scalar/w", Tensor::new(vec![1, 1], vec![dw])?);
        Ok(grads)
    }
}

/// Mean squared error; evaluates one validation point and emits a blank image.
pub struct SquaredError {
    pub image_shape: Vec<usize>,
}

impl Evaluator for SquaredError {
    fn evaluate(&self, _hypes: &Hypes, runner: &mut dyn InferenceRunner) -> TrainingResult<RawEvaluation> {
        let out = runner.infer(&Tensor::new(vec![1], vec![1.0])?)?;
        let diff = f64::from(out.data()[0]) - 2.0;
        Ok(RawEvaluation {
            scalars: vec![("val_loss".to_string(), diff * diff)],
            images: vec![("residuals".to_string(), Tensor::zeros(self.image_shape.clone()))],
        })
    }
}

impl Objective for SquaredError {
    fn loss(&self, _hypes: &Hypes, output: &Tensor, labels: &Tensor) -> TrainingResult<LossOutput> {
        #[allow(clippy::cast_precision_loss)]
        let n = output.len() as f32;
        let diffs: Vec<f32> = output.data().iter().zip(labels.data()).map(|(o, y)| o - y).collect();
        let total_loss = diffs.iter().map(|d| d * d).sum::<f32>() / n;
        let grad = Tensor::new(output.shape().to_vec(), diffs.iter().map(|d| 2.0 * d / n).collect())?;
        Ok(LossOutput { total_loss, grad })
    }

    fn metrics(&self, _hypes: &Hypes) -> Vec<(String, MetricFn)> {
        let abs_error: MetricFn = Arc::new(|output: &Tensor, labels: &Tensor| {
            output.data().iter().zip(labels.data()).map(|(o, y)| f64::from((o - y).abs())).sum()
        });
        vec![("abs_error".to_string(), abs_error)]
    }
}

/// Delegates to `inner` after sleeping for `delay`.
pub struct SlowEvaluator {
    pub inner: Arc<dyn Evaluator>,
    pub delay: Duration,
}

impl Evaluator for SlowEvaluator {
    fn evaluate(&self, hypes: &Hypes, runner: &mut dyn InferenceRunner) -> TrainingResult<RawEvaluation> {
        std::thread::sleep(self.delay);
        self.inner.evaluate(hypes, runner)
    }
}

/// Plain gradient descent that records every learning rate it is handed.
#[derive(Default)]
pub struct RecordingOptimizer {
    applied: Mutex<Vec<f64>>,
}

impl RecordingOptimizer {
    #[allow(clippy::cast_precision_loss)]
    pub fn rate_for(&self, step: u64) -> f64 {
        0.1 / (1.0 + step as f64)
    }

    pub fn applied(&self) -> Vec<f64> {
        self.applied.lock().unwrap().clone()
    }
}

impl Optimizer for RecordingOptimizer {
    fn get_learning_rate(&self, _hypes: &Hypes, step: u64) -> f64 {
        self.rate_for(step)
    }

    fn apply_gradients(
        &self,
        _hypes: &Hypes,
        variables: &mut Variables,
        gradients: &Gradients,
        learning_rate: f64,
    ) -> TrainingResult<()> {
        for (name, grad) in gradients.iter() {
            let var = variables.get_mut(name)?;
            for (v, g) in var.data_mut().iter_mut().zip(grad.data()) {
                #[allow(clippy::cast_possible_truncation)]
                let step = (learning_rate as f32) * g;
                *v -= step;
            }
        }
        self.applied.lock().unwrap().push(learning_rate);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn on_event(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn register_test_plugins(registry: &mut PluginRegistry) {
    registry.register_input("constant", |_| Ok(Arc::new(ConstantInput)));
    registry.register_architecture("scalar", |_| Ok(Arc::new(ScalarModel)));
    registry.register_objective("squared_error", |_| Ok(Arc::new(SquaredError { image_shape: vec![2, 2, 3] })));
    registry.register_optimizer("recording", |_| Ok(Arc::new(RecordingOptimizer::default())));
    registry.register_evaluator("squared_error", |_| Ok(Arc::new(SquaredError { image_shape: vec![2, 2, 3] })));
}

/// Write plugin descriptors and a hypes file into `dir`; returns the hypes path.
///
/// `logging` entries are merged over `display_iter = 5, eval_iter = 1000`.
pub fn write_test_hypes(dir: &Path, max_steps: u64, logging: Value) -> PathBuf {
    std::fs::write(dir.join("input.toml"), "plugin = \"constant\"\n").unwrap();
    std::fs::write(dir.join("arch.toml"), "plugin = \"scalar\"\n").unwrap();
    std::fs::write(dir.join("objective.toml"), "plugin = \"squared_error\"\n").unwrap();
    std::fs::write(dir.join("solver.toml"), "plugin = \"recording\"\n").unwrap();

    let mut log = json!({ "display_iter": 5, "eval_iter": 1000 });
    if let (Some(base), Value::Object(extra)) = (log.as_object_mut(), logging) {
        base.extend(extra);
    }
    let hypes = json!({
        "dirs": { "output_dir": "out", "data_dir": "data" },
        "model": {
            "input_file": "input.toml",
            "architecture_file": "arch.toml",
            "objective_file": "objective.toml",
            "optimizer_file": "solver.toml"
        },
        "solver": { "max_steps": max_steps, "batch_size": 1 },
        "logging": log
    });
    let path = dir.join("hypes.json");
    std::fs::write(&path, serde_json::to_string_pretty(&hypes).unwrap()).unwrap();
    path
}

pub fn load_test_hypes(dir: &Path, max_steps: u64) -> Hypes {
    let path = write_test_hypes(dir, max_steps, json!({}));
    HypesFile::from_path(&path).unwrap().resolve(&path, &RunNaming::default(), |_| None).unwrap()
}

pub fn test_plugin_set() -> PluginSet {
    let objective = Arc::new(SquaredError { image_shape: vec![2, 2, 3] });
    PluginSet {
        input: Arc::new(ConstantInput),
        architecture: Arc::new(ScalarModel),
        objective: objective.clone(),
        optimizer: Arc::new(RecordingOptimizer::default()),
        evaluator: objective,
    }
}

pub struct HarnessOptions {
    pub max_steps: u64,
    pub display_iter: u64,
    pub write_iter: Option<u64>,
    pub eval_iter: u64,
    pub step_write: u64,
    pub image_shape: Vec<usize>,
    pub nan_label_at: Option<u64>,
    /// Time every evaluation takes.
    pub eval_delay: Option<Duration>,
    /// Event stream location; defaults to the run's `events.kiln.jsonl`.
    pub summary_path: Option<PathBuf>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            max_steps: 10,
            display_iter: 5,
            write_iter: None,
            eval_iter: 1000,
            step_write: 1000,
            image_shape: vec![2, 2, 3],
            nan_label_at: None,
            eval_delay: None,
            summary_path: None,
        }
    }
}

/// A scheduler wired to a pre-filled queue, runnable without an async runtime.
pub struct Harness {
    pub sink: Arc<RecordingSink>,
    pub optimizer: Arc<RecordingOptimizer>,
    pub stop: CancellationToken,
    hypes: Arc<Hypes>,
    scheduler: TrainingLoopScheduler,
    ctx: ExecutionContext,
}

impl Harness {
    pub fn new(dir: &Path, options: HarnessOptions) -> Self {
        let mut logging = json!({
            "display_iter": options.display_iter,
            "eval_iter": options.eval_iter,
            "step_write": options.step_write,
        });
        if let Some(write_iter) = options.write_iter {
            logging["write_iter"] = json!(write_iter);
        }
        let path = write_test_hypes(dir, options.max_steps, logging);
        let hypes = Arc::new(
            HypesFile::from_path(&path).unwrap().resolve(&path, &RunNaming::default(), |_| None).unwrap(),
        );
        let layout = TrainingLayout::new(hypes.dirs.output_dir.clone());
        layout.ensure_dirs().unwrap();

        let optimizer = Arc::new(RecordingOptimizer::default());
        let objective = Arc::new(SquaredError { image_shape: options.image_shape });
        let evaluator: Arc<dyn Evaluator> = match options.eval_delay {
            Some(delay) => Arc::new(SlowEvaluator { inner: objective.clone(), delay }),
            None => objective.clone(),
        };
        let plugins = PluginSet {
            input: Arc::new(ConstantInput),
            architecture: Arc::new(ScalarModel),
            objective,
            optimizer: optimizer.clone(),
            evaluator,
        };

        let capacity = usize::try_from(options.max_steps).unwrap();
        let queue = Arc::new(BatchQueue::new(Split::Train, capacity));
        let tx = queue.sender().unwrap();
        for step in 0..options.max_steps {
            let label = if options.nan_label_at == Some(step) { f32::NAN } else { 2.0 };
            tx.try_send(pair(1.0, label)).unwrap();
        }
        drop(tx);
        queue.seal();

        let mut variables = Variables::new();
        let builder = GraphBuilder::new(&hypes, &plugins);
        let training = builder.build_training_graph(queue, &mut variables).unwrap();
        let inference = builder.build_inference_graph();

        let stop = CancellationToken::new();
        let ctx = ExecutionContext::new(
            training,
            inference,
            Box::new(LocalSession::new(variables)),
            CheckpointController::new(layout.root(), 5),
            SummaryWriter::create(&options.summary_path.unwrap_or_else(|| layout.events_path())).unwrap(),
            stop.clone(),
        );

        let sink = Arc::new(RecordingSink::default());
        let scheduler = TrainingLoopScheduler::new(hypes.clone(), &Settings::default(), &plugins, sink.clone());

        Self { sink, optimizer, stop, hypes, scheduler, ctx }
    }

    pub fn run(&mut self, start_step: u64) -> TrainingResult<LoopOutcome> {
        self.scheduler.run(&mut self.ctx, start_step)
    }

    pub fn output_dir(&self) -> &Path {
        &self.hypes.dirs.output_dir
    }
}
