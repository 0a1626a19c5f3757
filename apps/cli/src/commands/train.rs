//! Training command implementation.

use crate::config;
use anyhow::{Context, Result};
use kiln_training::{LogSink, LoopOutcome, RunNaming, TrainOptions, TrainingReport, continue_training, train};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug)]
pub enum Target {
    Hypes(PathBuf),
    Continue(PathBuf),
}

#[derive(Debug)]
pub struct TrainCommand {
    pub target: Target,
    pub resume: bool,
    pub name: Option<String>,
    pub project: Option<String>,
    pub save: bool,
}

pub async fn execute(command: TrainCommand, sink: &LogSink) -> Result<()> {
    let settings = config::load_settings()?;
    let stop = CancellationToken::new();
    watch_ctrl_c(stop.clone());

    let registry = kiln_plugins::builtin_registry();
    let mut options = TrainOptions::new(settings, stop);
    options.resume = command.resume;

    let report = match &command.target {
        Target::Hypes(path) => {
            let naming = RunNaming {
                name: command.name.clone(),
                project: command.project.clone(),
                save: command.save,
                ..RunNaming::default()
            };
            train(path, &naming, &registry, sink, options)
                .await
                .with_context(|| format!("Training with {} failed", path.display()))?
        }
        Target::Continue(dir) => continue_training(dir, &registry, sink, options)
            .await
            .with_context(|| format!("Continuing training in {} failed", dir.display()))?,
    };

    report_outcome(&report);
    sink.detach();
    Ok(())
}

/// Cancel `stop` on the first Ctrl-C; the loop finishes its current step.
fn watch_ctrl_c(stop: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Stop requested, finishing the current step.");
            stop.cancel();
        }
    });
}

fn report_outcome(report: &TrainingReport) {
    match report.outcome {
        LoopOutcome::Completed { last_step } => {
            info!("Training finished at step {last_step}. Output in {}", report.output_dir.display());
        }
        LoopOutcome::Interrupted { next_step } => {
            info!(
                "Training interrupted before step {next_step}. Continue with: kiln-train --continue {}",
                report.output_dir.display()
            );
        }
        LoopOutcome::AlreadyComplete => {
            info!("Nothing to train: {} already reached max_steps.", report.output_dir.display());
        }
    }

    for name in &report.shutdown.timed_out {
        warn!("Feeder worker {name} did not stop in time");
    }
    for (name, reason) in &report.shutdown.failed {
        warn!("Feeder worker {name} failed: {reason}");
    }
}
