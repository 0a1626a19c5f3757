use crate::data::DataSpec;
use crate::ops::{add_bias, matmul, matmul_tn, sum_rows};
use kiln_training::{Architecture, Forward, Gradients, Hypes, Tensor, TrainingResult, VariableScope, Variables};

pub const ID: &str = "linear";

const WEIGHTS: &str = "linear/weights";
const BIAS: &str = "linear/bias";

/// `y = x W + b`, zero-initialized.
pub struct Linear;

impl Architecture for Linear {
    fn init_variables(&self, hypes: &Hypes, scope: &mut VariableScope<'_>) -> TrainingResult<()> {
        let spec = DataSpec::from_hypes(hypes);
        scope.create(WEIGHTS, Tensor::zeros(vec![spec.input_dim, spec.output_dim]))?;
        scope.create(BIAS, Tensor::zeros(vec![spec.output_dim]))
    }

    fn inference(&self, _hypes: &Hypes, variables: &Variables, input: &Tensor) -> TrainingResult<Forward> {
        let mut output = matmul(input, variables.get(WEIGHTS)?)?;
        add_bias(&mut output, variables.get(BIAS)?)?;
        Ok(Forward { output, cache: Vec::new() })
    }

    fn backward(
        &self,
        _hypes: &Hypes,
        _variables: &Variables,
        input: &Tensor,
        _forward: &Forward,
        grad_output: &Tensor,
    ) -> TrainingResult<Gradients> {
        let mut grads = Gradients::new();
        grads.insert(WEIGHTS, matmul_tn(input, grad_output)?);
        grads.insert(BIAS, sum_rows(grad_output)?);
        Ok(grads)
    }
}
