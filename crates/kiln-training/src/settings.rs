//! Machine-wide training settings.
//!
//! These are the knobs that are not part of a model's hypes but still shape a run:
//! checkpoint cadence, status-line format, queue sizing and shutdown patience.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_STEP_STR: &str = "Step {step}/{total_steps}: loss = {loss_value:.2}; lr = {lr_value:.2e}; \
     {sec_per_batch:.3} sec (per Batch); {examples_per_sec:.1} imgs/sec";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Number of steps the status-line duration is averaged over.
    #[serde(default = "default_step_show")]
    pub step_show: u64,

    /// Checkpoint cadence in steps.
    #[serde(default = "default_step_write")]
    pub step_write: u64,

    /// Status line template.
    #[serde(default = "default_step_str")]
    pub step_str: String,

    /// How long shutdown waits for feeder workers.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Bound of the batch buffer between feeder workers and the training loop.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Older checkpoint files beyond this count are pruned.
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints_to_keep: usize,
}

fn default_step_show() -> u64 {
    50
}

fn default_step_write() -> u64 {
    1000
}

fn default_step_str() -> String {
    DEFAULT_STEP_STR.to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    32
}

fn default_max_checkpoints() -> usize {
    5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            step_show: default_step_show(),
            step_write: default_step_write(),
            step_str: default_step_str(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            queue_capacity: default_queue_capacity(),
            max_checkpoints_to_keep: default_max_checkpoints(),
        }
    }
}

/// Partially specified settings as found in a single file; `None` means "not set here".
#[derive(Debug, Clone, Default, Deserialize)]
struct SettingsOverlay {
    step_show: Option<u64>,
    step_write: Option<u64>,
    step_str: Option<String>,
    shutdown_timeout_secs: Option<u64>,
    queue_capacity: Option<usize>,
    max_checkpoints_to_keep: Option<usize>,
}

impl Settings {
    /// Global settings file, `~/.kiln/config.toml`.
    pub fn default_global_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".kiln")
            .join("config.toml")
    }

    /// Local settings file, `./.kilnrc`.
    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".kilnrc")
    }

    /// Discover and merge settings.
    ///
    /// Precedence (highest first):
    /// 1. `KILN_*` environment variables
    /// 2. Local file (./.kilnrc)
    /// 3. Global file (~/.kiln/config.toml)
    /// 4. Defaults
    pub fn discover_and_load() -> TrainingResult<Self> {
        let mut settings = Self::default();
        for path in [Self::default_global_path(), Self::default_local_path()] {
            if path.exists() {
                settings.merge_file(&path)?;
            }
        }
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Merge a TOML settings file into `self`.
    pub fn merge_file(&mut self, path: &Path) -> TrainingResult<()> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrainingError::config(format!("failed to read settings {}: {e}", path.display()))
        })?;
        let overlay: SettingsOverlay = toml::from_str(&content).map_err(|e| {
            TrainingError::config(format!("failed to parse settings {}: {e}", path.display()))
        })?;
        self.merge(overlay);
        Ok(())
    }

    fn merge(&mut self, other: SettingsOverlay) {
        if let Some(v) = other.step_show {
            self.step_show = v;
        }
        if let Some(v) = other.step_write {
            self.step_write = v;
        }
        if let Some(v) = other.step_str {
            self.step_str = v;
        }
        if let Some(v) = other.shutdown_timeout_secs {
            self.shutdown_timeout_secs = v;
        }
        if let Some(v) = other.queue_capacity {
            self.queue_capacity = v;
        }
        if let Some(v) = other.max_checkpoints_to_keep {
            self.max_checkpoints_to_keep = v;
        }
    }

    /// Apply `KILN_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> TrainingResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> TrainingResult<T> {
            raw.trim()
                .parse()
                .map_err(|_| TrainingError::config(format!("{key} must be a number, got {raw:?}")))
        }

        let mut overlay = SettingsOverlay::default();
        if let Some(raw) = lookup("KILN_STEP_SHOW") {
            overlay.step_show = Some(parse("KILN_STEP_SHOW", &raw)?);
        }
        if let Some(raw) = lookup("KILN_STEP_WRITE") {
            overlay.step_write = Some(parse("KILN_STEP_WRITE", &raw)?);
        }
        if let Some(raw) = lookup("KILN_STEP_STR") {
            overlay.step_str = Some(raw);
        }
        if let Some(raw) = lookup("KILN_SHUTDOWN_TIMEOUT_SECS") {
            overlay.shutdown_timeout_secs = Some(parse("KILN_SHUTDOWN_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = lookup("KILN_QUEUE_CAPACITY") {
            overlay.queue_capacity = Some(parse("KILN_QUEUE_CAPACITY", &raw)?);
        }
        if let Some(raw) = lookup("KILN_MAX_CHECKPOINTS") {
            overlay.max_checkpoints_to_keep = Some(parse("KILN_MAX_CHECKPOINTS", &raw)?);
        }
        self.merge(overlay);
        Ok(())
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.step_show == 0 {
            return Err(TrainingError::config("step_show must be >= 1"));
        }
        if self.step_write == 0 {
            return Err(TrainingError::config("step_write must be >= 1"));
        }
        if self.queue_capacity == 0 {
            return Err(TrainingError::config("queue_capacity must be >= 1"));
        }
        if self.max_checkpoints_to_keep == 0 {
            return Err(TrainingError::config("max_checkpoints_to_keep must be >= 1"));
        }
        Ok(())
    }
}
