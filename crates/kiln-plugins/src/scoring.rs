//! Residual statistics and heat-maps used by the evaluators.

use crate::data::Example;
use kiln_training::{InferenceRunner, Tensor, TrainingResult};

/// Side length of the residual heat-map; one cell per example.
pub const HEATMAP_SIDE: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct SplitScore {
    pub mse: f64,
    pub mae: f64,
    pub residuals: Vec<f32>,
}

/// Run the model on up to `limit` examples, one at a time.
pub fn score(examples: &[Example], runner: &mut dyn InferenceRunner, limit: usize) -> TrainingResult<SplitScore> {
    let mut residuals = Vec::new();
    for ex in examples.iter().take(limit) {
        let output = runner.infer(&Tensor::new(vec![ex.x.len()], ex.x.clone())?)?;
        residuals.extend(output.data().iter().zip(&ex.y).map(|(o, y)| o - y));
    }
    if residuals.is_empty() {
        return Ok(SplitScore { mse: 0.0, mae: 0.0, residuals });
    }
    #[allow(clippy::cast_precision_loss)]
    let n = residuals.len() as f64;
    let mse = residuals.iter().map(|r| f64::from(r * r)).sum::<f64>() / n;
    let mae = residuals.iter().map(|r| f64::from(r.abs())).sum::<f64>() / n;
    Ok(SplitScore { mse, mae, residuals })
}

/// `[8, 8, 3]` image of the first 64 residuals, row-major.
///
/// Residuals are scaled by the largest magnitude: positive ones shade red, negative
/// ones blue, and the green channel is bright where the residual is small.
pub fn residual_image(residuals: &[f32]) -> TrainingResult<Tensor> {
    let cells = HEATMAP_SIDE * HEATMAP_SIDE;
    let shown = &residuals[..residuals.len().min(cells)];
    let scale = shown.iter().fold(0.0_f32, |m, r| m.max(r.abs()));
    let mut pixels = vec![0.0; cells * 3];
    for (cell, r) in shown.iter().enumerate() {
        let v = if scale > 0.0 { r / scale } else { 0.0 };
        let px = &mut pixels[cell * 3..cell * 3 + 3];
        px[0] = v.max(0.0);
        px[1] = 1.0 - v.abs();
        px[2] = (-v).max(0.0);
    }
    Tensor::new(vec![HEATMAP_SIDE, HEATMAP_SIDE, 3], pixels)
}
