use crate::error::{TrainingError, TrainingResult};
use crate::graph::InferenceComputation;
use crate::hypes::Hypes;
use crate::plugin::{Evaluator, InferenceRunner, RawEvaluation};
use crate::session::ExecutionSession;
use crate::tensor::Tensor;

/// Normalized evaluation output. Every image is `[1, H, W, 3]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationResult {
    pub scalars: Vec<(String, f64)>,
    pub images: Vec<(String, Tensor)>,
}

/// Lets an evaluator run the inference computation through the session.
struct SessionRunner<'a> {
    session: &'a dyn ExecutionSession,
    inference: &'a InferenceComputation,
}

impl InferenceRunner for SessionRunner<'_> {
    fn infer(&mut self, input: &Tensor) -> TrainingResult<Tensor> {
        self.session.run_inference(self.inference, input)
    }
}

pub struct EvaluationDriver;

impl EvaluationDriver {
    pub fn evaluate(
        hypes: &Hypes,
        evaluator: &dyn Evaluator,
        session: &dyn ExecutionSession,
        inference: &InferenceComputation,
    ) -> TrainingResult<EvaluationResult> {
        let mut runner = SessionRunner { session, inference };
        let raw = evaluator.evaluate(hypes, &mut runner)?;
        normalize(raw)
    }
}

/// Validate names and bring every image to a single-item batch.
pub fn normalize(raw: RawEvaluation) -> TrainingResult<EvaluationResult> {
    if raw.scalars.iter().any(|(name, _)| name.is_empty()) {
        return Err(TrainingError::evaluation("evaluation scalar has an empty name"));
    }

    let images = raw
        .images
        .into_iter()
        .map(|(name, image)| {
            if name.is_empty() {
                return Err(TrainingError::evaluation("evaluation image has an empty name"));
            }
            let shape = image.shape().to_vec();
            let image = match shape.as_slice() {
                &[h, w, 3] => image.reshape(vec![1, h, w, 3])?,
                &[1, _, _, 3] => image,
                other => {
                    return Err(TrainingError::evaluation(format!(
                        "image {name} has shape {other:?}, expected [H, W, 3] or [1, H, W, 3]"
                    )));
                }
            };
            Ok((name, image))
        })
        .collect::<TrainingResult<Vec<_>>>()?;

    Ok(EvaluationResult { scalars: raw.scalars, images })
}
