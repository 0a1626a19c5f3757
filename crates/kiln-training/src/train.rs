//! Run entry points: fresh training from a hypes file and continuation of a training
//! folder.

use crate::error::TrainingResult;
use crate::feeder::ShutdownReport;
use crate::folder::initialize_training_folder;
use crate::graph::GraphBuilder;
use crate::hypes::{Hypes, RunNaming};
use crate::layout::TrainingLayout;
use crate::logging::LogSink;
use crate::plugin::Split;
use crate::progress::{ProgressSink, TracingProgressSink};
use crate::provision::maybe_download_and_extract;
use crate::registry::{PluginRegistry, PluginSet};
use crate::scheduler::{LoopOutcome, TrainingLoopScheduler};
use crate::session::SessionManager;
use crate::settings::Settings;
use crate::tensor::Variables;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct TrainOptions {
    pub settings: Settings,
    /// Restore the latest checkpoint of the output directory, if any.
    pub resume: bool,
    /// Cancelled on an external stop request.
    pub stop: CancellationToken,
    /// Defaults to a [`TracingProgressSink`] using the configured status template.
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl TrainOptions {
    #[must_use]
    pub fn new(settings: Settings, stop: CancellationToken) -> Self {
        Self { settings, resume: false, stop, progress: None }
    }
}

/// Hypes and plugins of a run whose folder is ready.
pub struct PreparedRun {
    pub hypes: Arc<Hypes>,
    pub plugins: PluginSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingReport {
    pub output_dir: PathBuf,
    pub start_step: u64,
    pub outcome: LoopOutcome,
    pub shutdown: ShutdownReport,
}

/// Resolve plugins, then initialize the training folder and provision the data.
///
/// Plugin resolution runs first so that a broken configuration leaves nothing on disk.
pub fn prepare_run(hypes: Hypes, registry: &PluginRegistry, sink: &LogSink) -> TrainingResult<PreparedRun> {
    let plugins = registry.load_modules_from_hypes(&hypes)?;
    initialize_training_folder(&hypes, sink)?;
    maybe_download_and_extract(&hypes, plugins.input.as_ref())?;
    Ok(PreparedRun { hypes: Arc::new(hypes), plugins })
}

/// Build the computations, start the session and feeder, and run the loop.
///
/// Must be called from within a multi-threaded tokio runtime.
pub async fn do_training(run: PreparedRun, options: TrainOptions) -> TrainingResult<TrainingReport> {
    let PreparedRun { hypes, plugins } = run;
    let settings = &options.settings;

    let queue = Arc::new(plugins.input.create_queues(&hypes, Split::Train, settings.queue_capacity)?);
    let builder = GraphBuilder::new(&hypes, &plugins);
    let mut variables = Variables::new();
    let training = builder.build_training_graph(queue.clone(), &mut variables)?;
    let inference = builder.build_inference_graph();

    let mut manager = SessionManager::start(
        &hypes,
        settings,
        training,
        inference,
        variables,
        queue,
        &options.stop,
        Handle::current(),
    )?;

    let start_step = if options.resume {
        match manager.restore_latest() {
            Ok(Some(step)) => {
                info!("Resuming from checkpoint at step {step}");
                step + 1
            }
            Ok(None) => 0,
            Err(e) => {
                manager.shutdown().await;
                return Err(e);
            }
        }
    } else {
        if let Err(e) = manager.context_mut().checkpoints.reset() {
            manager.shutdown().await;
            return Err(e);
        }
        0
    };

    if let Err(e) = manager.start_feeding(&hypes, plugins.input.as_ref(), start_step) {
        manager.shutdown().await;
        return Err(e);
    }

    let progress = options
        .progress
        .clone()
        .unwrap_or_else(|| Arc::new(TracingProgressSink::new(hypes.step_str(settings))));
    let scheduler = TrainingLoopScheduler::new(hypes.clone(), settings, &plugins, progress);
    let (result, shutdown) = manager.run(move |ctx| scheduler.run(ctx, start_step)).await;
    let outcome = result?;

    Ok(TrainingReport { output_dir: hypes.dirs.output_dir.clone(), start_step, outcome, shutdown })
}

/// Train from a hypes file.
pub async fn train(
    hypes_path: &Path,
    naming: &RunNaming,
    registry: &PluginRegistry,
    sink: &LogSink,
    options: TrainOptions,
) -> TrainingResult<TrainingReport> {
    let hypes = Hypes::load(hypes_path, naming)?;
    let run = prepare_run(hypes, registry, sink)?;
    do_training(run, options).await
}

/// Continue the run stored in `logdir` from its latest checkpoint.
///
/// Hypes and plugin descriptors come from the folder's snapshot; the snapshot itself
/// is left untouched.
pub async fn continue_training(
    logdir: &Path,
    registry: &PluginRegistry,
    sink: &LogSink,
    options: TrainOptions,
) -> TrainingResult<TrainingReport> {
    let hypes = Hypes::from_snapshot(logdir)?;
    let plugins = registry.load_modules_from_hypes(&hypes)?;

    let layout = TrainingLayout::new(hypes.dirs.output_dir.clone());
    if let Err(e) = sink.attach(&layout.output_log_path()) {
        warn!("Could not open {}: {e}", layout.output_log_path().display());
    }
    info!("Continuing training in {}", layout.root().display());

    maybe_download_and_extract(&hypes, plugins.input.as_ref())?;
    let run = PreparedRun { hypes: Arc::new(hypes), plugins };
    do_training(run, TrainOptions { resume: true, ..options }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrainingError;
    use crate::plugin::PluginRole;
    use crate::test_support::{register_test_plugins, write_test_hypes};
    use serde_json::json;
    use tempfile::TempDir;

    fn registry() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        register_test_plugins(&mut registry);
        registry
    }

    #[test]
    fn test_unresolvable_plugin_leaves_no_output_dir() {
        let temp = TempDir::new().unwrap();
        let path = write_test_hypes(temp.path(), 10, json!({}));
        std::fs::remove_file(temp.path().join("objective.toml")).unwrap();
        let hypes = Hypes::load(&path, &RunNaming::default()).unwrap();
        let output_dir = hypes.dirs.output_dir.clone();

        let err = prepare_run(hypes, &registry(), &LogSink::new()).err().unwrap();

        assert!(matches!(err, TrainingError::PluginResolution { role: PluginRole::Objective, .. }));
        assert!(!output_dir.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_full_run_then_continue_past_end_is_noop() {
        let temp = TempDir::new().unwrap();
        let path = write_test_hypes(temp.path(), 6, json!({ "display_iter": 2, "step_write": 3 }));
        let sink = LogSink::new();
        let options = TrainOptions::new(Settings::default(), CancellationToken::new());

        let report = train(&path, &RunNaming::default(), &registry(), &sink, options).await.unwrap();

        assert_eq!(report.outcome, LoopOutcome::Completed { last_step: 5 });
        assert!(report.shutdown.is_clean());
        assert!(report.output_dir.join("model.ckpt-2.json").exists());
        assert!(report.output_dir.join("model.ckpt-5.json").exists());
        assert!(report.output_dir.join("output.log").exists());

        let options = TrainOptions::new(Settings::default(), CancellationToken::new());
        let again = continue_training(&report.output_dir, &registry(), &sink, options).await.unwrap();
        assert_eq!(again.start_step, 6);
        assert_eq!(again.outcome, LoopOutcome::AlreadyComplete);
        sink.detach();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fresh_rerun_into_used_folder_starts_a_new_index() {
        let temp = TempDir::new().unwrap();
        let sink = LogSink::new();
        let path = write_test_hypes(temp.path(), 6, json!({ "display_iter": 2, "step_write": 3 }));
        let options = TrainOptions::new(Settings::default(), CancellationToken::new());
        let first = train(&path, &RunNaming::default(), &registry(), &sink, options).await.unwrap();
        assert!(first.output_dir.join("model.ckpt-5.json").exists());

        let path = write_test_hypes(temp.path(), 3, json!({ "display_iter": 2, "step_write": 3 }));
        let options = TrainOptions::new(Settings::default(), CancellationToken::new());
        let rerun = train(&path, &RunNaming::default(), &registry(), &sink, options).await.unwrap();
        assert_eq!(rerun.output_dir, first.output_dir);
        assert_eq!(rerun.outcome, LoopOutcome::Completed { last_step: 2 });
        assert!(!rerun.output_dir.join("model.ckpt-5.json").exists());

        let options = TrainOptions::new(Settings::default(), CancellationToken::new());
        let again = continue_training(&rerun.output_dir, &registry(), &sink, options).await.unwrap();
        assert_eq!(again.start_step, 3);
        assert_eq!(again.outcome, LoopOutcome::AlreadyComplete);
        sink.detach();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pre_cancelled_run_is_interrupted_and_joined() {
        let temp = TempDir::new().unwrap();
        let path = write_test_hypes(temp.path(), 100, json!({}));
        let stop = CancellationToken::new();
        stop.cancel();
        let sink = LogSink::new();

        let report = train(&path, &RunNaming::default(), &registry(), &sink, TrainOptions::new(Settings::default(), stop))
            .await
            .unwrap();

        assert_eq!(report.outcome, LoopOutcome::Interrupted { next_step: 0 });
        assert!(report.shutdown.is_clean());
        sink.detach();
    }
}
