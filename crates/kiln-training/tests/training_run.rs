use kiln_training::{
    Architecture, Batch, BatchProducer, BatchQueue, CheckpointController, Coordinator, Evaluator, Forward,
    Gradients, Hypes, InferenceRunner, InputSource, LogSink, LoopOutcome, LossOutput, Objective, Optimizer,
    PluginRegistry, ProgressEvent, ProgressSink, RawEvaluation, RunNaming, Settings, Split, Tensor,
    TrainOptions, TrainingError, TrainingResult, VariableScope, Variables, continue_training, read_events,
    train,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const XS: [f32; 4] = [0.0, 1.0, 2.0, 3.0];

struct FixedProducer;

impl BatchProducer for FixedProducer {
    fn next_batch(&mut self) -> TrainingResult<Option<Batch>> {
        let ys: Vec<f32> = XS.iter().map(|x| 2.0 * x + 1.0).collect();
        Ok(Some(Batch {
            inputs: Tensor::new(vec![4, 1], XS.to_vec())?,
            labels: Tensor::new(vec![4, 1], ys)?,
        }))
    }
}

struct FixedInput;

impl InputSource for FixedInput {
    fn start_enqueuing_threads(
        &self,
        _hypes: &Hypes,
        queue: &BatchQueue,
        split: Split,
        _start_step: u64,
        coordinator: &mut Coordinator,
    ) -> TrainingResult<()> {
        for i in 0..2 {
            coordinator.spawn_producer(format!("{split}-{i}"), queue, Box::new(FixedProducer))?;
        }
        Ok(())
    }
}

struct Line;

impl Architecture for Line {
    fn init_variables(&self, _hypes: &Hypes, scope: &mut VariableScope<'_>) -> TrainingResult<()> {
        scope.create("line/w", Tensor::scalar(0.0))?;
        scope.create("line/b", Tensor::scalar(0.0))
    }

    fn inference(&self, _hypes: &Hypes, variables: &Variables, input: &Tensor) -> TrainingResult<Forward> {
        let w = variables.get("line/w")?.data()[0];
        let b = variables.get("line/b")?.data()[0];
        let out = input.data().iter().map(|x| w * x + b).collect();
        Ok(Forward { output: Tensor::new(input.shape().to_vec(), out)?, cache: Vec::new() })
    }

    fn backward(
        &self,
        _hypes: &Hypes,
        _variables: &Variables,
        input: &Tensor,
        _forward: &Forward,
        grad_output: &Tensor,
    ) -> TrainingResult<Gradients> {
        let dw = input.data().iter().zip(grad_output.data()).map(|(x, g)| x * g).sum();
        let db = grad_output.data().iter().sum();
        let mut grads = Gradients::new();
        grads.insert("line/w", Tensor::scalar(dw));
        grads.insert("line/b", Tensor::scalar(db));
        Ok(grads)
    }
}

struct Mse;

impl Evaluator for Mse {
    fn evaluate(&self, _hypes: &Hypes, runner: &mut dyn InferenceRunner) -> TrainingResult<RawEvaluation> {
        let out = runner.infer(&Tensor::new(vec![1], vec![10.0])?)?;
        Ok(RawEvaluation {
            scalars: vec![("error_at_10".to_string(), f64::from((out.data()[0] - 21.0).abs()))],
            images: vec![("fit".to_string(), Tensor::zeros(vec![2, 2, 3]))],
        })
    }
}

impl Objective for Mse {
    fn loss(&self, _hypes: &Hypes, output: &Tensor, labels: &Tensor) -> TrainingResult<LossOutput> {
        let n = output.len() as f32;
        let diffs: Vec<f32> = output.data().iter().zip(labels.data()).map(|(o, y)| o - y).collect();
        Ok(LossOutput {
            total_loss: diffs.iter().map(|d| d * d).sum::<f32>() / n,
            grad: Tensor::new(output.shape().to_vec(), diffs.iter().map(|d| 2.0 * d / n).collect())?,
        })
    }
}

struct Decaying;

impl Optimizer for Decaying {
    fn get_learning_rate(&self, hypes: &Hypes, step: u64) -> f64 {
        let base = hypes.get_f64("solver.learning_rate").unwrap_or(0.05);
        base * 0.9_f64.powi(i32::try_from(step).unwrap_or(i32::MAX))
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
                *v -= learning_rate as f32 * g;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<ProgressEvent>>);

impl ProgressSink for Recorder {
    fn on_event(&self, event: &ProgressEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

fn registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register_input("fixed", |_| Ok(Arc::new(FixedInput)));
    registry.register_architecture("line", |_| Ok(Arc::new(Line)));
    registry.register_objective("mse", |_| Ok(Arc::new(Mse)));
    registry.register_optimizer("decaying", |_| Ok(Arc::new(Decaying)));
    registry
}

fn write_run(dir: &Path, output: &str, max_steps: u64, logging: serde_json::Value) -> PathBuf {
    std::fs::write(dir.join("input.toml"), "plugin = \"fixed\"\n").unwrap();
    std::fs::write(dir.join("arch.toml"), "plugin = \"line\"\n").unwrap();
    std::fs::write(dir.join("objective.toml"), "plugin = \"mse\"\n").unwrap();
    std::fs::write(dir.join("solver.toml"), "plugin = \"decaying\"\n").unwrap();
    let hypes = json!({
        "dirs": { "output_dir": output },
        "model": {
            "input_file": "input.toml",
            "architecture_file": "arch.toml",
            "objective_file": "objective.toml",
            "optimizer_file": "solver.toml"
        },
        "solver": { "max_steps": max_steps, "batch_size": 4, "learning_rate": 0.05 },
        "logging": logging
    });
    let path = dir.join(format!("{output}.json"));
    std::fs::write(&path, serde_json::to_string_pretty(&hypes).unwrap()).unwrap();
    path
}

fn options(progress: Option<Arc<dyn ProgressSink>>) -> TrainOptions {
    let mut options = TrainOptions::new(Settings::default(), CancellationToken::new());
    options.progress = progress;
    options
}

#[tokio::test(flavor = "multi_thread")]
async fn test_short_run_schedule_end_to_end() {
    let temp = TempDir::new().unwrap();
    let path = write_run(
        temp.path(),
        "scenario",
        10,
        json!({ "display_iter": 5, "write_iter": 10, "eval_iter": 10, "step_write": 10 }),
    );
    let recorder = Arc::new(Recorder::default());
    let sink = LogSink::new();

    let report = train(&path, &RunNaming::default(), &registry(), &sink, options(Some(recorder.clone())))
        .await
        .unwrap();
    sink.detach();

    assert_eq!(report.outcome, LoopOutcome::Completed { last_step: 9 });
    assert!(report.shutdown.is_clean(), "{:?}", report.shutdown);

    let events = recorder.0.lock().unwrap().clone();
    let status: Vec<u64> = events
        .iter()
        .filter_map(|e| if let ProgressEvent::Status { step, .. } = e { Some(*step) } else { None })
        .collect();
    assert_eq!(status, vec![0, 5]);

    let checkpoints: Vec<PathBuf> = std::fs::read_dir(&report.output_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with("model.ckpt-"))
        .collect();
    assert_eq!(checkpoints, vec![report.output_dir.join("model.ckpt-9.json")]);

    let stream = read_events(&report.output_dir.join("events.kiln.jsonl")).unwrap();
    let tagged: Vec<(u64, String)> = stream.iter().map(|e| (e.step, e.value.tag().to_string())).collect();
    assert_eq!(
        tagged,
        vec![
            (0, "training/total_loss".to_string()),
            (0, "training/learning_rate".to_string()),
            (9, "Evaluation/error_at_10".to_string()),
            (9, "fit".to_string()),
        ]
    );

    let snapshot = report.output_dir.join("model_files");
    for name in ["hypes.json", "data_input.toml", "architecture.toml", "objective.toml", "solver.toml"] {
        assert!(snapshot.join(name).is_file(), "{name}");
    }
    assert!(!snapshot.join("eval.toml").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resumed_run_matches_uninterrupted_run() {
    let temp = TempDir::new().unwrap();
    let logging = json!({ "display_iter": 2, "eval_iter": 100, "step_write": 4 });
    let sink = LogSink::new();

    let straight = write_run(temp.path(), "straight", 8, logging.clone());
    let full = train(&straight, &RunNaming::default(), &registry(), &sink, options(None)).await.unwrap();

    let split = write_run(temp.path(), "split", 4, logging);
    let first = train(&split, &RunNaming::default(), &registry(), &sink, options(None)).await.unwrap();
    assert_eq!(first.outcome, LoopOutcome::Completed { last_step: 3 });

    let snapshot_path = first.output_dir.join("model_files/hypes.json");
    let mut snapshot: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&snapshot_path).unwrap()).unwrap();
    snapshot["solver"]["max_steps"] = json!(8);
    std::fs::write(&snapshot_path, serde_json::to_string_pretty(&snapshot).unwrap()).unwrap();

    let resumed = continue_training(&first.output_dir, &registry(), &sink, options(None)).await.unwrap();
    sink.detach();
    assert_eq!(resumed.start_step, 4);
    assert_eq!(resumed.outcome, LoopOutcome::Completed { last_step: 7 });

    let a = CheckpointController::new(&full.output_dir, 5).load().unwrap();
    let b = CheckpointController::new(&resumed.output_dir, 5).load().unwrap();
    assert_eq!(a.step, 7);
    assert_eq!(b.step, 7);
    assert_eq!(a.variables, b.variables);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_objective_file_creates_nothing() {
    let temp = TempDir::new().unwrap();
    let path = write_run(temp.path(), "broken", 10, json!({ "display_iter": 5, "eval_iter": 10 }));
    std::fs::remove_file(temp.path().join("objective.toml")).unwrap();

    let err = train(&path, &RunNaming::default(), &registry(), &LogSink::new(), options(None))
        .await
        .unwrap_err();

    assert!(matches!(err, TrainingError::PluginResolution { .. }));
    assert!(!temp.path().join("broken").exists());
}
