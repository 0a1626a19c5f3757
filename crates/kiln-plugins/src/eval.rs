use crate::data::DataSpec;
use crate::scoring::{residual_image, score};
use kiln_training::{
    Evaluator, Hypes, InferenceRunner, PluginDescriptor, PluginRole, RawEvaluation, Split, TrainingResult,
};
use serde::Deserialize;

pub const ID: &str = "regression_eval";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegressionEvalParams {
    pub max_examples: usize,
    /// Also score the training split, to watch the generalization gap.
    pub include_train: bool,
}

impl Default for RegressionEvalParams {
    fn default() -> Self {
        Self { max_examples: 256, include_train: true }
    }
}

/// Scores the validation split (and optionally the training split), reporting
/// `{split}_mse`, `{split}_mae` and a `{split}_residuals` heat-map for each.
pub struct RegressionEval {
    params: RegressionEvalParams,
}

impl RegressionEval {
    pub fn from_descriptor(descriptor: &PluginDescriptor) -> TrainingResult<Self> {
        Ok(Self { params: descriptor.params(PluginRole::Evaluator)? })
    }
}

impl Evaluator for RegressionEval {
    fn evaluate(&self, hypes: &Hypes, runner: &mut dyn InferenceRunner) -> TrainingResult<RawEvaluation> {
        let spec = DataSpec::from_hypes(hypes);
        let mut splits = vec![Split::Val];
        if self.params.include_train {
            splits.insert(0, Split::Train);
        }

        let mut result = RawEvaluation::default();
        for split in splits {
            let examples = spec.load(hypes, split)?;
            let scored = score(&examples, runner, self.params.max_examples)?;
            result.scalars.push((format!("{split}_mse"), scored.mse));
            result.scalars.push((format!("{split}_mae"), scored.mae));
            result.images.push((format!("{split}_residuals"), residual_image(&scored.residuals)?));
        }
        Ok(result)
    }
}
