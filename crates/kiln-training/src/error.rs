use crate::plugin::PluginRole;
use std::path::PathBuf;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

/// Coarse error classes used to decide whether a failure aborts the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    PluginResolution,
    Divergence,
    Backend,
    Evaluation,
    Summary,
    CheckpointWrite,
    CheckpointNotFound,
    Interrupted,
    Io,
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("failed to resolve {role} plugin: {reason}")]
    PluginResolution { role: PluginRole, reason: String },

    #[error("loss diverged at step {step}: {loss}")]
    NumericalDivergence { step: u64, loss: f64 },

    #[error("computation error: {0}")]
    Backend(String),

    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("summary write failed: {0}")]
    SummaryWrite(String),

    #[error("checkpoint write failed: {0}")]
    CheckpointWrite(String),

    #[error("no checkpoint found in {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("checkpoint is corrupt: {0}")]
    CheckpointCorrupt(String),

    #[error("input queue closed: {0}")]
    QueueClosed(String),

    #[error("training interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn plugin(role: PluginRole, reason: impl Into<String>) -> Self {
        Self::PluginResolution { role, reason: reason.into() }
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::Toml(_) => ErrorKind::Configuration,
            Self::PluginResolution { .. } => ErrorKind::PluginResolution,
            Self::NumericalDivergence { .. } => ErrorKind::Divergence,
            Self::Backend(_) | Self::QueueClosed(_) | Self::Other(_) => ErrorKind::Backend,
            Self::Evaluation(_) => ErrorKind::Evaluation,
            Self::SummaryWrite(_) => ErrorKind::Summary,
            Self::CheckpointWrite(_) | Self::CheckpointCorrupt(_) => ErrorKind::CheckpointWrite,
            Self::CheckpointNotFound(_) => ErrorKind::CheckpointNotFound,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::Io(_) | Self::Json(_) => ErrorKind::Io,
        }
    }

    /// Whether the training run must stop when this error surfaces.
    ///
    /// Summary failures are dropped with a warning, a missing checkpoint falls back to a
    /// fresh start and an interrupt ends the loop cleanly; everything else aborts.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::Summary | ErrorKind::CheckpointNotFound | ErrorKind::Interrupted
        )
    }
}
