//! Run configuration ("hypes").
//!
//! A hypes document is read once per run. [`HypesFile`] is the document as written by the
//! user, with optional directories; [`Hypes::resolve`] fills those in exactly once and
//! produces the immutable [`Hypes`] every other component borrows.

use crate::error::{TrainingError, TrainingResult};
use crate::layout::TrainingLayout;
use crate::plugin::PluginRole;
use crate::settings::Settings;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dirs {
    pub base_path: PathBuf,
    pub output_dir: PathBuf,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFiles {
    pub input_file: PathBuf,
    pub architecture_file: PathBuf,
    pub objective_file: PathBuf,
    pub optimizer_file: PathBuf,
    /// Falls back to the objective when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator_file: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    pub max_steps: u64,
    pub batch_size: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub display_iter: u64,
    pub eval_iter: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_iter: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_write: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_show: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_str: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The hypes document as found on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypesFile {
    #[serde(default)]
    pub dirs: DirsFile,
    pub model: ModelFiles,
    pub solver: SolverConfig,
    pub logging: LoggingConfig,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Inputs that decide the default output directory name.
#[derive(Debug, Clone)]
pub struct RunNaming {
    pub name: Option<String>,
    pub project: Option<String>,
    pub save: bool,
    pub now: DateTime<Local>,
}

impl Default for RunNaming {
    fn default() -> Self {
        Self { name: None, project: None, save: false, now: Local::now() }
    }
}

/// Resolved, read-only run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypes {
    pub dirs: Dirs,
    pub model: ModelFiles,
    pub solver: SolverConfig,
    pub logging: LoggingConfig,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HypesFile {
    pub fn from_path(path: &Path) -> TrainingResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrainingError::config(format!("failed to read hypes {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            TrainingError::config(format!("failed to parse hypes {}: {e}", path.display()))
        })
    }

    /// Fill in missing directories.
    ///
    /// * `base_path` defaults to the directory holding the hypes file.
    /// * `output_dir` defaults to `<base>/<runs>/[<project>/]<run name>` where `<runs>` is
    ///   `KILN_DIR_RUNS` or `RUNS`, and the run name is `debug` unless the run is saved or
    ///   named, in which case it is `[<name>_]<hypes stem>_<YYYY_MM_DD_HH.MM>`.
    /// * `data_dir` defaults to `<base>/<KILN_DIR_DATA or DATA>`.
    ///
    /// Relative paths are joined to `base_path`.
    pub fn resolve<F>(self, hypes_path: &Path, naming: &RunNaming, env: F) -> TrainingResult<Hypes>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_path = match self.dirs.base_path {
            Some(p) => p,
            None => {
                let absolute = std::path::absolute(hypes_path)?;
                absolute
                    .parent()
                    .map(Path::to_path_buf)
                    .ok_or_else(|| TrainingError::config("hypes path has no parent directory"))?
            }
        };

        let output_dir = match self.dirs.output_dir {
            Some(p) => base_path.join(p),
            None => {
                let mut runs_dir =
                    base_path.join(env("KILN_DIR_RUNS").unwrap_or_else(|| "RUNS".to_string()));
                if let Some(project) = &naming.project {
                    runs_dir = runs_dir.join(project);
                }
                runs_dir.join(run_name(hypes_path, naming))
            }
        };

        let data_dir = match self.dirs.data_dir {
            Some(p) => base_path.join(p),
            None => base_path.join(env("KILN_DIR_DATA").unwrap_or_else(|| "DATA".to_string())),
        };

        let hypes = Hypes {
            dirs: Dirs { base_path, output_dir, data_dir },
            model: self.model,
            solver: self.solver,
            logging: self.logging,
            extra: self.extra,
        };
        hypes.validate()?;
        Ok(hypes)
    }
}

fn run_name(hypes_path: &Path, naming: &RunNaming) -> String {
    if !naming.save && naming.name.is_none() {
        return "debug".to_string();
    }
    let stem = hypes_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "hypes".to_string());
    let stem = match &naming.name {
        Some(name) => format!("{name}_{stem}"),
        None => stem,
    };
    format!("{stem}_{}", naming.now.format("%Y_%m_%d_%H.%M"))
}

impl Hypes {
    /// Load and resolve a hypes file using the process environment.
    pub fn load(path: &Path, naming: &RunNaming) -> TrainingResult<Self> {
        HypesFile::from_path(path)?.resolve(path, naming, |k| std::env::var(k).ok())
    }

    /// Rebuild hypes from a training folder's snapshot.
    ///
    /// Plugin files are redirected to the snapshot copies in `model_files/` so that a
    /// continued run uses exactly the descriptors of the original one.
    pub fn from_snapshot(output_dir: &Path) -> TrainingResult<Self> {
        let layout = TrainingLayout::new(output_dir.to_path_buf());
        let path = layout.hypes_snapshot_path();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            TrainingError::config(format!("failed to read snapshot {}: {e}", path.display()))
        })?;
        let mut hypes: Self = serde_json::from_str(&content).map_err(|e| {
            TrainingError::config(format!("failed to parse snapshot {}: {e}", path.display()))
        })?;

        hypes.dirs.output_dir = output_dir.to_path_buf();
        hypes.model.input_file = layout.plugin_snapshot_path(PluginRole::Input);
        hypes.model.architecture_file = layout.plugin_snapshot_path(PluginRole::Architecture);
        hypes.model.objective_file = layout.plugin_snapshot_path(PluginRole::Objective);
        hypes.model.optimizer_file = layout.plugin_snapshot_path(PluginRole::Optimizer);
        if hypes.model.evaluator_file.is_some() {
            hypes.model.evaluator_file = Some(layout.plugin_snapshot_path(PluginRole::Evaluator));
        }
        hypes.validate()?;
        Ok(hypes)
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.solver.max_steps == 0 {
            return Err(TrainingError::config("solver.max_steps must be >= 1"));
        }
        if self.solver.batch_size == 0 {
            return Err(TrainingError::config("solver.batch_size must be >= 1"));
        }
        if self.logging.display_iter == 0 {
            return Err(TrainingError::config("logging.display_iter must be >= 1"));
        }
        if self.logging.eval_iter == 0 {
            return Err(TrainingError::config("logging.eval_iter must be >= 1"));
        }
        if self.logging.write_iter == Some(0) {
            return Err(TrainingError::config("logging.write_iter must be >= 1"));
        }
        if self.logging.step_write == Some(0) {
            return Err(TrainingError::config("logging.step_write must be >= 1"));
        }
        if self.logging.step_show == Some(0) {
            return Err(TrainingError::config("logging.step_show must be >= 1"));
        }
        Ok(())
    }

    pub fn max_steps(&self) -> u64 {
        self.solver.max_steps
    }

    pub fn batch_size(&self) -> u64 {
        self.solver.batch_size
    }

    /// Training-summary cadence, `5 × display_iter` unless configured.
    pub fn write_iter(&self) -> u64 {
        self.logging.write_iter.unwrap_or(self.logging.display_iter.saturating_mul(5))
    }

    pub fn step_write(&self, settings: &Settings) -> u64 {
        self.logging.step_write.unwrap_or(settings.step_write)
    }

    pub fn step_show(&self, settings: &Settings) -> u64 {
        self.logging.step_show.unwrap_or(settings.step_show)
    }

    pub fn step_str<'a>(&'a self, settings: &'a Settings) -> &'a str {
        self.logging.step_str.as_deref().unwrap_or(&settings.step_str)
    }

    /// Configured location of a plugin file, relative paths joined to `base_path`.
    pub fn plugin_path(&self, role: PluginRole) -> Option<PathBuf> {
        let configured = match role {
            PluginRole::Input => Some(&self.model.input_file),
            PluginRole::Architecture => Some(&self.model.architecture_file),
            PluginRole::Objective => Some(&self.model.objective_file),
            PluginRole::Optimizer => Some(&self.model.optimizer_file),
            PluginRole::Evaluator => self.model.evaluator_file.as_ref(),
        }?;
        Some(self.dirs.base_path.join(configured))
    }

    /// Look up a value by dotted path, e.g. `"arch.hidden_units"`.
    pub fn get(&self, dotted: &str) -> Option<&Value> {
        let mut parts = dotted.split('.');
        let first = parts.next()?;
        let mut current = match first {
            "solver" => self.solver.extra.get(parts.next()?)?,
            "logging" => self.logging.extra.get(parts.next()?)?,
            "model" => self.model.extra.get(parts.next()?)?,
            other => self.extra.get(other)?,
        };
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    pub fn get_f64(&self, dotted: &str) -> Option<f64> {
        self.get(dotted).and_then(Value::as_f64)
    }

    pub fn get_u64(&self, dotted: &str) -> Option<u64> {
        self.get(dotted).and_then(Value::as_u64)
    }

    pub fn get_str(&self, dotted: &str) -> Option<&str> {
        self.get(dotted).and_then(Value::as_str)
    }
}
