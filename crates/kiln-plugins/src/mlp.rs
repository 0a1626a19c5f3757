//! `mlp`: one tanh hidden layer.
//!
//! Hidden width comes from `arch.hidden_units` (default 16). Weights are drawn uniformly
//! from `±1/sqrt(fan_in)` with the descriptor's `seed`, so two runs with the same
//! descriptor start from the same parameters.

use crate::data::DataSpec;
use crate::ops::{add_bias, map, matmul, matmul_nt, matmul_tn, sum_rows};
use kiln_training::{
    Architecture, Forward, Gradients, Hypes, PluginDescriptor, PluginRole, Tensor, TrainingError, TrainingResult,
    VariableScope, Variables,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

pub const ID: &str = "mlp";

const W1: &str = "mlp/hidden/weights";
const B1: &str = "mlp/hidden/bias";
const W2: &str = "mlp/output/weights";
const B2: &str = "mlp/output/bias";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MlpParams {
    pub seed: u64,
}

impl Default for MlpParams {
    fn default() -> Self {
        Self { seed: 1 }
    }
}

pub struct Mlp {
    params: MlpParams,
}

impl Mlp {
    pub fn from_descriptor(descriptor: &PluginDescriptor) -> TrainingResult<Self> {
        Ok(Self { params: descriptor.params(PluginRole::Architecture)? })
    }

    fn hidden_units(hypes: &Hypes) -> usize {
        hypes.get_u64("arch.hidden_units").and_then(|v| usize::try_from(v).ok()).filter(|v| *v > 0).unwrap_or(16)
    }
}

fn uniform(rng: &mut StdRng, rows: usize, cols: usize) -> TrainingResult<Tensor> {
    #[allow(clippy::cast_precision_loss)]
    let limit = 1.0 / (rows as f32).sqrt();
    Tensor::new(vec![rows, cols], (0..rows * cols).map(|_| rng.gen_range(-limit..limit)).collect())
}

impl Architecture for Mlp {
    fn init_variables(&self, hypes: &Hypes, scope: &mut VariableScope<'_>) -> TrainingResult<()> {
        let spec = DataSpec::from_hypes(hypes);
        let hidden = Self::hidden_units(hypes);
        let mut rng = StdRng::seed_from_u64(self.params.seed);
        scope.create(W1, uniform(&mut rng, spec.input_dim, hidden)?)?;
        scope.create(B1, Tensor::zeros(vec![hidden]))?;
        scope.create(W2, uniform(&mut rng, hidden, spec.output_dim)?)?;
        scope.create(B2, Tensor::zeros(vec![spec.output_dim]))
    }

    fn inference(&self, _hypes: &Hypes, variables: &Variables, input: &Tensor) -> TrainingResult<Forward> {
        let mut pre = matmul(input, variables.get(W1)?)?;
        add_bias(&mut pre, variables.get(B1)?)?;
        let hidden = map(&pre, f32::tanh)?;
        let mut output = matmul(&hidden, variables.get(W2)?)?;
        add_bias(&mut output, variables.get(B2)?)?;
        Ok(Forward { output, cache: vec![hidden] })
    }

    fn backward(
        &self,
        _hypes: &Hypes,
        variables: &Variables,
        input: &Tensor,
        forward: &Forward,
        grad_output: &Tensor,
    ) -> TrainingResult<Gradients> {
        let hidden = forward
            .cache
            .first()
            .ok_or_else(|| TrainingError::backend("mlp backward needs the hidden activations"))?;

        let grad_hidden = matmul_nt(grad_output, variables.get(W2)?)?;
        let grad_pre = Tensor::new(
            grad_hidden.shape().to_vec(),
            grad_hidden.data().iter().zip(hidden.data()).map(|(g, h)| g * (1.0 - h * h)).collect(),
        )?;

        let mut grads = Gradients::new();
        grads.insert(W2, matmul_tn(hidden, grad_output)?);
        grads.insert(B2, sum_rows(grad_output)?);
        grads.insert(W1, matmul_tn(input, &grad_pre)?);
        grads.insert(B1, sum_rows(&grad_pre)?);
        Ok(grads)
    }
}
