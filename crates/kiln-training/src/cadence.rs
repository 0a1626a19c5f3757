//! Step cadences.
//!
//! Every periodic activity of the loop is an independent [`Cadence`] predicate over the
//! step counter, so the schedule can be checked without running anything.

use crate::hypes::Hypes;
use crate::settings::Settings;

/// Which side of the step a period is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// Fires when `step % every == 0`, so step 0 fires.
    BeforeStep,
    /// Fires when `(step + 1) % every == 0`, i.e. after `every` completed steps.
    AfterStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    every: u64,
    anchor: Anchor,
    fire_on_final: bool,
}

impl Cadence {
    #[must_use]
    pub fn before_step(every: u64) -> Self {
        Self { every: every.max(1), anchor: Anchor::BeforeStep, fire_on_final: false }
    }

    #[must_use]
    pub fn after_step(every: u64) -> Self {
        Self { every: every.max(1), anchor: Anchor::AfterStep, fire_on_final: false }
    }

    /// Also fire on the last step of the run.
    #[must_use]
    pub fn with_final(mut self) -> Self {
        self.fire_on_final = true;
        self
    }

    #[must_use]
    pub fn every(&self) -> u64 {
        self.every
    }

    #[must_use]
    pub fn fires(&self, step: u64, max_steps: u64) -> bool {
        let periodic = match self.anchor {
            Anchor::BeforeStep => step % self.every == 0,
            Anchor::AfterStep => (step + 1) % self.every == 0,
        };
        periodic || (self.fire_on_final && step + 1 == max_steps)
    }
}

/// What a step does besides the update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepActivities {
    pub display: bool,
    pub write_summary: bool,
    pub evaluate: bool,
    pub checkpoint: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CadenceTable {
    pub display: Cadence,
    pub write: Cadence,
    pub evaluate: Cadence,
    pub checkpoint: Cadence,
}

impl CadenceTable {
    pub fn from_hypes(hypes: &Hypes, settings: &Settings) -> Self {
        Self {
            display: Cadence::before_step(hypes.logging.display_iter),
            write: Cadence::before_step(hypes.write_iter()),
            evaluate: Cadence::after_step(hypes.logging.eval_iter).with_final(),
            checkpoint: Cadence::after_step(hypes.step_write(settings)).with_final(),
        }
    }

    /// Training summaries are only written on display steps.
    #[must_use]
    pub fn activities(&self, step: u64, max_steps: u64) -> StepActivities {
        let display = self.display.fires(step, max_steps);
        StepActivities {
            display,
            write_summary: display && self.write.fires(step, max_steps),
            evaluate: self.evaluate.fires(step, max_steps),
            checkpoint: self.checkpoint.fires(step, max_steps),
        }
    }
}
