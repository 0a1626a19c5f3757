use crate::error::TrainingResult;
use crate::plugin::PluginRole;
use std::path::{Path, PathBuf};

pub const MODEL_FILES_DIR: &str = "model_files";
pub const HYPES_SNAPSHOT: &str = "hypes.json";
pub const OUTPUT_LOG: &str = "output.log";
pub const CHECKPOINT_PREFIX: &str = "model.ckpt";
pub const CHECKPOINT_INDEX: &str = "checkpoint";
pub const EVENTS_FILE: &str = "events.kiln.jsonl";

/// Filesystem layout of a training folder.
///
/// ```text
/// <output_dir>/
///   model_files/hypes.json
///   model_files/{data_input,architecture,objective,solver,eval}.toml
///   output.log
///   checkpoint
///   model.ckpt-<step>.json
///   events.kiln.jsonl
/// ```
#[derive(Debug, Clone)]
pub struct TrainingLayout {
    root: PathBuf,
}

impl TrainingLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn model_files_dir(&self) -> PathBuf {
        self.root.join(MODEL_FILES_DIR)
    }

    #[must_use]
    pub fn hypes_snapshot_path(&self) -> PathBuf {
        self.model_files_dir().join(HYPES_SNAPSHOT)
    }

    /// Canonical snapshot name for a plugin file, independent of its original name.
    #[must_use]
    pub fn plugin_snapshot_path(&self, role: PluginRole) -> PathBuf {
        let name = match role {
            PluginRole::Input => "data_input.toml",
            PluginRole::Architecture => "architecture.toml",
            PluginRole::Objective => "objective.toml",
            PluginRole::Optimizer => "solver.toml",
            PluginRole::Evaluator => "eval.toml",
        };
        self.model_files_dir().join(name)
    }

    #[must_use]
    pub fn output_log_path(&self) -> PathBuf {
        self.root.join(OUTPUT_LOG)
    }

    #[must_use]
    pub fn checkpoint_index_path(&self) -> PathBuf {
        self.root.join(CHECKPOINT_INDEX)
    }

    #[must_use]
    pub fn checkpoint_file_name(step: u64) -> String {
        format!("{CHECKPOINT_PREFIX}-{step}.json")
    }

    #[must_use]
    pub fn checkpoint_path(&self, step: u64) -> PathBuf {
        self.root.join(Self::checkpoint_file_name(step))
    }

    #[must_use]
    pub fn events_path(&self) -> PathBuf {
        self.root.join(EVENTS_FILE)
    }

    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.model_files_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let temp = TempDir::new().unwrap();
        let layout = TrainingLayout::new(temp.path().join("run"));

        assert!(layout.hypes_snapshot_path().ends_with("model_files/hypes.json"));
        assert!(layout.plugin_snapshot_path(PluginRole::Optimizer).ends_with("model_files/solver.toml"));
        assert!(layout.checkpoint_path(42).ends_with("model.ckpt-42.json"));
        assert!(layout.output_log_path().ends_with("run/output.log"));
    }

    #[test]
    fn test_ensure_dirs_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let layout = TrainingLayout::new(temp.path().join("run"));
        layout.ensure_dirs().unwrap();
        layout.ensure_dirs().unwrap();
        assert!(layout.model_files_dir().is_dir());
    }
}
