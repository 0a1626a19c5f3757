//! `mse`: mean squared error objective.
//!
//! Also serves as the evaluator when a run has no `evaluator_file`, scoring the
//! validation split.

use crate::data::DataSpec;
use crate::ops::ensure_same_shape;
use crate::scoring::{residual_image, score};
use kiln_training::{
    Evaluator, Hypes, InferenceRunner, LossOutput, MetricFn, Objective, PluginDescriptor, PluginRole, RawEvaluation,
    Split, Tensor, TrainingResult,
};
use serde::Deserialize;
use std::sync::Arc;

pub const ID: &str = "mse";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MseParams {
    /// Validation examples scored per evaluation.
    pub max_eval_examples: usize,
}

impl Default for MseParams {
    fn default() -> Self {
        Self { max_eval_examples: 256 }
    }
}

pub struct MeanSquaredError {
    params: MseParams,
}

impl MeanSquaredError {
    pub fn from_descriptor(descriptor: &PluginDescriptor) -> TrainingResult<Self> {
        Ok(Self { params: descriptor.params(PluginRole::Objective)? })
    }
}

fn mean_abs(output: &Tensor, labels: &Tensor) -> f64 {
    let n = output.len().max(1);
    #[allow(clippy::cast_precision_loss)]
    let mean = output.data().iter().zip(labels.data()).map(|(o, y)| f64::from((o - y).abs())).sum::<f64>()
        / n as f64;
    mean
}

fn root_mean_square(output: &Tensor, labels: &Tensor) -> f64 {
    let n = output.len().max(1);
    #[allow(clippy::cast_precision_loss)]
    let mean = output.data().iter().zip(labels.data()).map(|(o, y)| f64::from((o - y) * (o - y))).sum::<f64>()
        / n as f64;
    mean.sqrt()
}

impl Objective for MeanSquaredError {
    fn loss(&self, _hypes: &Hypes, output: &Tensor, labels: &Tensor) -> TrainingResult<LossOutput> {
        ensure_same_shape(output, labels, "mse loss")?;
        #[allow(clippy::cast_precision_loss)]
        let n = output.len().max(1) as f32;
        let diff: Vec<f32> = output.data().iter().zip(labels.data()).map(|(o, y)| o - y).collect();
        let total_loss = diff.iter().map(|d| d * d).sum::<f32>() / n;
        let grad = Tensor::new(output.shape().to_vec(), diff.iter().map(|d| 2.0 * d / n).collect())?;
        Ok(LossOutput { total_loss, grad })
    }

    fn metrics(&self, _hypes: &Hypes) -> Vec<(String, MetricFn)> {
        let mae: MetricFn = Arc::new(mean_abs);
        let rmse: MetricFn = Arc::new(root_mean_square);
        vec![("mae".to_string(), mae), ("rmse".to_string(), rmse)]
    }
}

impl Evaluator for MeanSquaredError {
    fn evaluate(&self, hypes: &Hypes, runner: &mut dyn InferenceRunner) -> TrainingResult<RawEvaluation> {
        let val = DataSpec::from_hypes(hypes).load(hypes, Split::Val)?;
        let scored = score(&val, runner, self.params.max_eval_examples)?;
        Ok(RawEvaluation {
            scalars: vec![("mse".to_string(), scored.mse), ("mae".to_string(), scored.mae)],
            images: vec![("val_residuals".to_string(), residual_image(&scored.residuals)?)],
        })
    }
}
