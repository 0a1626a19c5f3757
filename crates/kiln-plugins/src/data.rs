//! Regression examples on disk.
//!
//! Datasets are JSONL files, one `{"x": [...], "y": [...]}` object per line, located by
//! the `data` section of the hypes:
//!
//! ```json
//! "data": { "train_file": "train.jsonl", "val_file": "val.jsonl", "input_dim": 3, "output_dim": 1 }
//! ```

use kiln_training::{Hypes, Split, Tensor, TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub x: Vec<f32>,
    pub y: Vec<f32>,
}

/// Dataset shape and file names read from `hypes.data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSpec {
    pub train_file: String,
    pub val_file: String,
    pub input_dim: usize,
    pub output_dim: usize,
}

impl DataSpec {
    pub fn from_hypes(hypes: &Hypes) -> Self {
        let dim = |key: &str| {
            hypes.get_u64(key).and_then(|v| usize::try_from(v).ok()).filter(|v| *v > 0).unwrap_or(1)
        };
        Self {
            train_file: hypes.get_str("data.train_file").unwrap_or("train.jsonl").to_string(),
            val_file: hypes.get_str("data.val_file").unwrap_or("val.jsonl").to_string(),
            input_dim: dim("data.input_dim"),
            output_dim: dim("data.output_dim"),
        }
    }

    pub fn path(&self, data_dir: &Path, split: Split) -> PathBuf {
        match split {
            Split::Train => data_dir.join(&self.train_file),
            Split::Val => data_dir.join(&self.val_file),
        }
    }

    /// Read and validate one split from `hypes.dirs.data_dir`.
    pub fn load(&self, hypes: &Hypes, split: Split) -> TrainingResult<Vec<Example>> {
        let path = self.path(&hypes.dirs.data_dir, split);
        let numbered = read_numbered(&path)?;
        self.validate(&numbered, &path)?;
        Ok(numbered.into_iter().map(|(_, ex)| ex).collect())
    }

    fn validate(&self, numbered: &[(usize, Example)], path: &Path) -> TrainingResult<()> {
        if numbered.is_empty() {
            return Err(TrainingError::config(format!("dataset {} is empty", path.display())));
        }
        for (line, ex) in numbered {
            if ex.x.len() != self.input_dim || ex.y.len() != self.output_dim {
                return Err(TrainingError::config(format!(
                    "{} line {line}: expected {} inputs and {} targets, got {} and {}",
                    path.display(),
                    self.input_dim,
                    self.output_dim,
                    ex.x.len(),
                    ex.y.len()
                )));
            }
        }
        Ok(())
    }
}

pub fn read_jsonl(path: &Path) -> TrainingResult<Vec<Example>> {
    Ok(read_numbered(path)?.into_iter().map(|(_, ex)| ex).collect())
}

/// Examples paired with their 1-based line in the file; blank lines are skipped.
fn read_numbered(path: &Path) -> TrainingResult<Vec<(usize, Example)>> {
    let file = std::fs::File::open(path)
        .map_err(|e| TrainingError::config(format!("failed to open dataset {}: {e}", path.display())))?;
    let mut examples = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let example = serde_json::from_str(&line).map_err(|e| {
            TrainingError::config(format!("{} line {}: {e}", path.display(), idx + 1))
        })?;
        examples.push((idx + 1, example));
    }
    Ok(examples)
}

pub fn write_jsonl(path: &Path, examples: &[Example]) -> TrainingResult<()> {
    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    for ex in examples {
        serde_json::to_writer(&mut out, ex)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Stack examples into `([n, input_dim], [n, output_dim])`.
pub fn stack<'a>(
    examples: impl IntoIterator<Item = &'a Example>,
    spec: &DataSpec,
) -> TrainingResult<(Tensor, Tensor)> {
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    let mut n = 0;
    for ex in examples {
        xs.extend_from_slice(&ex.x);
        ys.extend_from_slice(&ex.y);
        n += 1;
    }
    Ok((Tensor::new(vec![n, spec.input_dim], xs)?, Tensor::new(vec![n, spec.output_dim], ys)?))
}
