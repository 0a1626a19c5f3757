//! Dense values exchanged between the orchestrator and plugins.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Row-major dense `f32` tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> TrainingResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TrainingError::backend(format!(
                "tensor shape {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self { shape, data: vec![0.0; len] }
    }

    #[must_use]
    pub fn scalar(value: f32) -> Self {
        Self { shape: Vec::new(), data: vec![value] }
    }

    /// `[rows, cols]` matrix from row slices of equal length.
    pub fn from_rows(rows: &[Vec<f32>]) -> TrainingResult<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(TrainingError::backend("rows have different lengths"));
        }
        let data = rows.iter().flatten().copied().collect();
        Self::new(vec![rows.len(), cols], data)
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[must_use]
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn reshape(self, shape: Vec<usize>) -> TrainingResult<Self> {
        Self::new(shape, self.data)
    }

    /// Insert a leading axis of size 1, turning a single example into a batch of one.
    #[must_use]
    pub fn expand_dims0(self) -> Self {
        let mut shape = Vec::with_capacity(self.shape.len() + 1);
        shape.push(1);
        shape.extend_from_slice(&self.shape);
        Self { shape, data: self.data }
    }

    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

/// Named trainable parameters of a model.
///
/// Names are scoped (`"linear/weights"`); iteration order is the name order, which keeps
/// checkpoints byte-stable for identical parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Variables {
    values: BTreeMap<String, Tensor>,
}

impl Variables {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Tensor) -> Option<Tensor> {
        self.values.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> TrainingResult<&Tensor> {
        self.values
            .get(name)
            .ok_or_else(|| TrainingError::backend(format!("unknown variable: {name}")))
    }

    pub fn get_mut(&mut self, name: &str) -> TrainingResult<&mut Tensor> {
        self.values
            .get_mut(name)
            .ok_or_else(|| TrainingError::backend(format!("unknown variable: {name}")))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Check that `other` has the same names and shapes as `self`.
    pub fn ensure_compatible(&self, other: &Self) -> TrainingResult<()> {
        for (name, tensor) in &self.values {
            let theirs = other.values.get(name).ok_or_else(|| {
                TrainingError::CheckpointCorrupt(format!("missing variable {name}"))
            })?;
            if theirs.shape() != tensor.shape() {
                return Err(TrainingError::CheckpointCorrupt(format!(
                    "variable {name} has shape {:?}, expected {:?}",
                    theirs.shape(),
                    tensor.shape()
                )));
            }
        }
        if let Some(extra) = other.values.keys().find(|k| !self.values.contains_key(*k)) {
            return Err(TrainingError::CheckpointCorrupt(format!("unexpected variable {extra}")));
        }
        Ok(())
    }
}
