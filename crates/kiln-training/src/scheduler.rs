//! The training loop.
//!
//! For each step `s` in `[start, max_steps)`, in order:
//!
//! 1. run one update with `lr = optimizer.get_learning_rate(hypes, s)`; on display steps
//!    the loss is fetched in the same pass, then the status line, the metric line and
//!    (on write steps) the `training/` summaries follow;
//! 2. evaluate, when the evaluation cadence fires;
//! 3. checkpoint tagged with `s`, when the checkpoint cadence fires.
//!
//! A stop request is honoured at the next step boundary.

use crate::cadence::CadenceTable;
use crate::error::{TrainingError, TrainingResult};
use crate::evaluation::{EvaluationDriver, EvaluationResult};
use crate::hypes::Hypes;
use crate::plugin::{Evaluator, Optimizer};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::registry::PluginSet;
use crate::session::ExecutionContext;
use crate::settings::Settings;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Every step up to `max_steps - 1` ran.
    Completed { last_step: u64 },
    /// Stopped before `next_step` ran.
    Interrupted { next_step: u64 },
    /// The start step was already past the end.
    AlreadyComplete,
}

pub struct TrainingLoopScheduler {
    hypes: Arc<Hypes>,
    cadences: CadenceTable,
    optimizer: Arc<dyn Optimizer>,
    evaluator: Arc<dyn Evaluator>,
    progress: Arc<dyn ProgressSink>,
    step_show: u64,
}

impl TrainingLoopScheduler {
    pub fn new(
        hypes: Arc<Hypes>,
        settings: &Settings,
        plugins: &PluginSet,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            cadences: CadenceTable::from_hypes(&hypes, settings),
            step_show: hypes.step_show(settings),
            optimizer: plugins.optimizer.clone(),
            evaluator: plugins.evaluator.clone(),
            progress,
            hypes,
        }
    }

    #[must_use]
    pub fn cadences(&self) -> &CadenceTable {
        &self.cadences
    }

    pub fn run(&self, ctx: &mut ExecutionContext, start_step: u64) -> TrainingResult<LoopOutcome> {
        let max_steps = self.hypes.max_steps();
        if start_step >= max_steps {
            debug!(start_step, max_steps, "Nothing left to train");
            return Ok(LoopOutcome::AlreadyComplete);
        }

        self.progress.on_event(&ProgressEvent::Started { start_step, max_steps });
        let mut timer = Instant::now();

        for step in start_step..max_steps {
            if ctx.stop_token().is_cancelled() {
                return Ok(self.interrupted(ctx, step));
            }

            let activities = self.cadences.activities(step, max_steps);
            let lr = self.optimizer.get_learning_rate(&self.hypes, step);

            let executed = if activities.display {
                ctx.session.run_update_with_loss(&ctx.training, step, lr).map(Some)
            } else {
                ctx.session.run_update(&ctx.training, step, lr).map(|()| None)
            };
            let loss = match executed {
                Ok(loss) => loss,
                Err(TrainingError::QueueClosed(_)) if ctx.stop_token().is_cancelled() => {
                    return Ok(self.interrupted(ctx, step));
                }
                Err(e) => return Err(e),
            };

            if let Some(loss) = loss {
                self.display(ctx, step, max_steps, loss, lr, activities.write_summary, timer.elapsed())?;
                timer = Instant::now();
            }

            if activities.evaluate {
                self.evaluate(ctx, step)?;
                timer = Instant::now();
            }

            if activities.checkpoint {
                let path = ctx.checkpoints.save(ctx.session.variables(), step)?;
                self.progress.on_event(&ProgressEvent::Checkpointed { step, path });
                timer = Instant::now();
            }
        }

        flush_summaries(ctx);
        let last_step = max_steps - 1;
        self.progress.on_event(&ProgressEvent::Finished { last_step });
        Ok(LoopOutcome::Completed { last_step })
    }

    fn interrupted(&self, ctx: &mut ExecutionContext, step: u64) -> LoopOutcome {
        flush_summaries(ctx);
        self.progress.on_event(&ProgressEvent::Interrupted { step });
        LoopOutcome::Interrupted { next_step: step }
    }

    #[allow(clippy::too_many_arguments)]
    fn display(
        &self,
        ctx: &mut ExecutionContext,
        step: u64,
        max_steps: u64,
        loss: f64,
        learning_rate: f64,
        write_summary: bool,
        elapsed: Duration,
    ) -> TrainingResult<()> {
        #[allow(clippy::cast_precision_loss)]
        let sec_per_batch = elapsed.as_secs_f64() / self.step_show as f64;
        #[allow(clippy::cast_precision_loss)]
        let examples_per_sec =
            if sec_per_batch > 0.0 { self.hypes.batch_size() as f64 / sec_per_batch } else { 0.0 };

        self.progress.on_event(&ProgressEvent::Status {
            step,
            total_steps: max_steps,
            loss,
            learning_rate,
            sec_per_batch,
            examples_per_sec,
        });

        let metrics = ctx.session.run_metrics(&ctx.training)?;
        self.progress.on_event(&ProgressEvent::Metrics { step, values: metrics.clone() });

        if write_summary {
            let loss_tag = format!("training/{}", ctx.training.loss.name());
            let lr_tag = format!("training/{}", ctx.training.learning_rate.name());
            let metric_tags: Vec<(String, f64)> =
                metrics.into_iter().map(|(name, v)| (format!("training/{name}"), v)).collect();

            let written = ctx
                .summaries
                .add_scalars(
                    [(loss_tag.as_str(), loss), (lr_tag.as_str(), learning_rate)]
                        .into_iter()
                        .chain(metric_tags.iter().map(|(t, v)| (t.as_str(), *v))),
                    step,
                )
                .and_then(|()| ctx.summaries.flush());
            match written {
                Ok(()) => self.progress.on_event(&ProgressEvent::SummaryWritten { step }),
                Err(e) => warn!(step, "Dropping training summary: {e}"),
            }
        }
        Ok(())
    }

    fn evaluate(&self, ctx: &mut ExecutionContext, step: u64) -> TrainingResult<()> {
        self.progress.on_event(&ProgressEvent::EvaluationStarted { step });
        let EvaluationResult { scalars, images } = EvaluationDriver::evaluate(
            &self.hypes,
            self.evaluator.as_ref(),
            ctx.session.as_ref(),
            &ctx.inference,
        )?;

        let tags: Vec<(String, f64)> =
            scalars.iter().map(|(name, v)| (format!("Evaluation/{name}"), *v)).collect();
        if let Err(e) = ctx.summaries.add_scalars(tags.iter().map(|(t, v)| (t.as_str(), *v)), step) {
            warn!(step, "Dropping evaluation summary: {e}");
        }
        for (name, image) in &images {
            if let Err(e) = ctx.summaries.add_image(name, image, step) {
                warn!(step, image = %name, "Dropping evaluation image: {e}");
            }
        }
        if let Err(e) = ctx.summaries.flush() {
            warn!(step, "Failed to flush summaries: {e}");
        }

        self.progress.on_event(&ProgressEvent::Evaluated {
            step,
            scalars,
            images: images.into_iter().map(|(name, _)| name).collect(),
        });
        Ok(())
    }
}

fn flush_summaries(ctx: &mut ExecutionContext) {
    if let Err(e) = ctx.summaries.flush() {
        warn!("Failed to flush summaries: {e}");
    }
}
