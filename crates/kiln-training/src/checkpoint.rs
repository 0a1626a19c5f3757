//! Step-keyed persistence of trainable parameters.
//!
//! Each checkpoint is a JSON file `model.ckpt-<step>.json`; the `checkpoint` index next
//! to them lists the retained files with their SHA-256 and names the latest one.

use crate::error::{TrainingError, TrainingResult};
use crate::layout::TrainingLayout;
use crate::tensor::Variables;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub format_version: u32,
    pub step: u64,
    pub created_at: DateTime<Utc>,
    pub variables: Variables,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub step: u64,
    pub file: String,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointIndex {
    pub latest_step: Option<u64>,
    #[serde(default)]
    pub entries: Vec<CheckpointEntry>,
}

impl CheckpointIndex {
    pub fn read(path: &Path) -> TrainingResult<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| TrainingError::CheckpointCorrupt(format!("{}: {e}", path.display())))
    }

    #[must_use]
    pub fn latest(&self) -> Option<&CheckpointEntry> {
        let step = self.latest_step?;
        self.entries.iter().find(|e| e.step == step)
    }
}

#[derive(Debug, Clone)]
pub struct RestoredCheckpoint {
    pub step: u64,
    pub variables: Variables,
    pub path: PathBuf,
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

#[derive(Debug, Clone)]
pub struct CheckpointController {
    layout: TrainingLayout,
    max_to_keep: usize,
}

impl CheckpointController {
    #[must_use]
    pub fn new(output_dir: &Path, max_to_keep: usize) -> Self {
        Self { layout: TrainingLayout::new(output_dir.to_path_buf()), max_to_keep: max_to_keep.max(1) }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        self.layout.root()
    }

    /// Start a fresh index, deleting the checkpoints a previous run left behind.
    pub fn reset(&self) -> TrainingResult<()> {
        let index_path = self.layout.checkpoint_index_path();
        if index_path.exists() {
            std::fs::remove_file(&index_path)?;
        }
        if !self.layout.root().is_dir() {
            return Ok(());
        }
        let prefix = format!("{}-", crate::layout::CHECKPOINT_PREFIX);
        for entry in std::fs::read_dir(self.layout.root())? {
            let path = entry?.path();
            let stale = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".json"));
            if stale {
                debug!(path = %path.display(), "Removing checkpoint of a previous run");
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Persist `variables` tagged with `step`. A failed write is retried once.
    pub fn save(&self, variables: &Variables, step: u64) -> TrainingResult<PathBuf> {
        match self.try_save(variables, step) {
            Ok(path) => Ok(path),
            Err(first) => {
                warn!(step, "Checkpoint write failed, retrying: {first}");
                self.try_save(variables, step)
                    .map_err(|e| TrainingError::CheckpointWrite(format!("step {step}: {e}")))
            }
        }
    }

    fn try_save(&self, variables: &Variables, step: u64) -> TrainingResult<PathBuf> {
        let created_at = Utc::now();
        let file = CheckpointFile {
            format_version: CHECKPOINT_FORMAT_VERSION,
            step,
            created_at,
            variables: variables.clone(),
        };
        let path = self.layout.checkpoint_path(step);
        write_atomic(&path, &serde_json::to_vec(&file)?)?;

        let index_path = self.layout.checkpoint_index_path();
        let mut index = if index_path.exists() {
            CheckpointIndex::read(&index_path).unwrap_or_else(|e| {
                warn!("Rebuilding unreadable checkpoint index: {e}");
                CheckpointIndex::default()
            })
        } else {
            CheckpointIndex::default()
        };

        index.entries.retain(|e| e.step != step);
        index.entries.push(CheckpointEntry {
            step,
            file: TrainingLayout::checkpoint_file_name(step),
            sha256: sha256_file(&path)?,
            created_at,
        });
        index.latest_step = Some(step);

        // Entries are kept in write order; the newest is last and never pruned.
        let excess = index.entries.len().saturating_sub(self.max_to_keep);
        for stale in index.entries.drain(..excess) {
            let stale_path = self.layout.root().join(&stale.file);
            if let Err(e) = std::fs::remove_file(&stale_path) {
                debug!(path = %stale_path.display(), "Could not prune checkpoint: {e}");
            }
        }

        write_atomic(&index_path, &serde_json::to_vec_pretty(&index)?)?;
        Ok(path)
    }

    /// Load the latest checkpoint listed in the index.
    pub fn load(&self) -> TrainingResult<RestoredCheckpoint> {
        let index_path = self.layout.checkpoint_index_path();
        if !index_path.exists() {
            return Err(TrainingError::CheckpointNotFound(self.layout.root().to_path_buf()));
        }
        let index = CheckpointIndex::read(&index_path)?;
        let entry = index
            .latest()
            .ok_or_else(|| TrainingError::CheckpointNotFound(self.layout.root().to_path_buf()))?;

        let path = self.layout.root().join(&entry.file);
        if !path.exists() {
            return Err(TrainingError::CheckpointNotFound(path));
        }
        let digest = sha256_file(&path)?;
        if digest != entry.sha256 {
            return Err(TrainingError::CheckpointCorrupt(format!(
                "{} hash mismatch: expected {}, found {digest}",
                entry.file, entry.sha256
            )));
        }

        let content = std::fs::read_to_string(&path)?;
        let file: CheckpointFile = serde_json::from_str(&content)
            .map_err(|e| TrainingError::CheckpointCorrupt(format!("{}: {e}", entry.file)))?;
        if file.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(TrainingError::CheckpointCorrupt(format!(
                "{} has format version {}, expected {CHECKPOINT_FORMAT_VERSION}",
                entry.file, file.format_version
            )));
        }

        info!(step = file.step, path = %path.display(), "Restored checkpoint");
        Ok(RestoredCheckpoint { step: file.step, variables: file.variables, path })
    }
}
