//! `regression_jsonl` input.
//!
//! Loads a JSONL split once, then each worker cycles over its own shuffled order of the
//! examples, emitting batches of `solver.batch_size`. The download hook synthesizes both
//! splits from a seeded linear target when the training file is missing.
//!
//! On resume each worker fast-forwards past its share of the batches already trained on.
//! With one worker the resumed stream is exactly the uninterrupted one; with several the
//! queue interleaving is not deterministic, so the steps are split evenly across workers.

use crate::data::{DataSpec, Example, stack, write_jsonl};
use kiln_training::{
    Batch, BatchProducer, BatchQueue, Coordinator, DatasetDownload, Hypes, InputSource, PluginDescriptor,
    PluginRole, Split, TrainingResult,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub const ID: &str = "regression_jsonl";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputParams {
    pub workers: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub synthesize: SynthParams,
}

impl Default for InputParams {
    fn default() -> Self {
        Self { workers: 1, shuffle: true, seed: 42, synthesize: SynthParams::default() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SynthParams {
    pub train_examples: usize,
    pub val_examples: usize,
    pub noise: f32,
}

impl Default for SynthParams {
    fn default() -> Self {
        Self { train_examples: 256, val_examples: 64, noise: 0.05 }
    }
}

pub struct RegressionJsonl {
    params: InputParams,
}

impl RegressionJsonl {
    pub fn from_descriptor(descriptor: &PluginDescriptor) -> TrainingResult<Self> {
        Ok(Self { params: descriptor.params(PluginRole::Input)? })
    }
}

impl InputSource for RegressionJsonl {
    fn start_enqueuing_threads(
        &self,
        hypes: &Hypes,
        queue: &BatchQueue,
        split: Split,
        start_step: u64,
        coordinator: &mut Coordinator,
    ) -> TrainingResult<()> {
        let spec = DataSpec::from_hypes(hypes);
        let examples = Arc::new(spec.load(hypes, split)?);
        let batch_size = usize::try_from(hypes.batch_size()).unwrap_or(usize::MAX).min(examples.len());
        let workers = self.params.workers.max(1);

        for worker in 0..workers {
            let mut producer = CyclingProducer::new(
                examples.clone(),
                spec.clone(),
                batch_size,
                self.params.shuffle,
                self.params.seed.wrapping_add(worker as u64),
            );
            producer.skip_batches(batches_before(start_step, worker, workers));
            coordinator.spawn_producer(format!("{ID}-{split}-{worker}"), queue, Box::new(producer))?;
        }
        Ok(())
    }

    fn download(&self) -> Option<&dyn DatasetDownload> {
        Some(self)
    }
}

impl DatasetDownload for RegressionJsonl {
    fn maybe_download_and_extract(&self, hypes: &Hypes, data_dir: &Path) -> TrainingResult<()> {
        let spec = DataSpec::from_hypes(hypes);
        let train_path = spec.path(data_dir, Split::Train);
        if train_path.exists() {
            return Ok(());
        }

        let synth = &self.params.synthesize;
        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let weights: Vec<f32> = (0..spec.input_dim * spec.output_dim).map(|_| rng.gen_range(-2.0..2.0)).collect();
        let bias: Vec<f32> = (0..spec.output_dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let mut sample = |n: usize| -> Vec<Example> {
            (0..n)
                .map(|_| {
                    let x: Vec<f32> = (0..spec.input_dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
                    let y = (0..spec.output_dim)
                        .map(|o| {
                            let dot: f32 =
                                x.iter().enumerate().map(|(i, xi)| xi * weights[i * spec.output_dim + o]).sum();
                            dot + bias[o] + synth.noise * rng.gen_range(-1.0..1.0)
                        })
                        .collect();
                    Example { x, y }
                })
                .collect()
        };

        let train = sample(synth.train_examples.max(1));
        let val = sample(synth.val_examples.max(1));
        write_jsonl(&train_path, &train)?;
        write_jsonl(&spec.path(data_dir, Split::Val), &val)?;
        info!(
            train = train.len(),
            val = val.len(),
            "Synthesized regression data in {}",
            data_dir.display()
        );
        Ok(())
    }
}

/// Batches `worker` of `workers` produced for steps `0..start_step`.
fn batches_before(start_step: u64, worker: usize, workers: usize) -> u64 {
    let workers = workers as u64;
    let worker = worker as u64;
    start_step / workers + u64::from(worker < start_step % workers)
}

/// Endless pass over `examples` in epochs, reshuffling between epochs.
pub struct CyclingProducer {
    examples: Arc<Vec<Example>>,
    spec: DataSpec,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    order: Vec<usize>,
    cursor: usize,
}

impl CyclingProducer {
    pub fn new(examples: Arc<Vec<Example>>, spec: DataSpec, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        let order = (0..examples.len()).collect();
        let mut producer = Self {
            examples,
            spec,
            batch_size: batch_size.max(1),
            shuffle,
            rng: StdRng::seed_from_u64(seed),
            order,
            cursor: 0,
        };
        producer.start_epoch();
        producer
    }

    fn start_epoch(&mut self) {
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        self.cursor = 0;
    }

    /// Advance past `batches` batches without building them, reshuffling at epoch
    /// boundaries exactly as `next_batch` would.
    pub fn skip_batches(&mut self, batches: u64) {
        if self.order.is_empty() || batches == 0 {
            return;
        }
        let mut remaining = batches.saturating_mul(self.batch_size as u64);
        while remaining > 0 {
            if self.cursor == self.order.len() {
                self.start_epoch();
            }
            let available = (self.order.len() - self.cursor) as u64;
            let take = remaining.min(available);
            self.cursor += take as usize;
            remaining -= take;
        }
    }
}

impl BatchProducer for CyclingProducer {
    fn next_batch(&mut self) -> TrainingResult<Option<Batch>> {
        if self.examples.is_empty() {
            return Ok(None);
        }
        let examples = self.examples.clone();
        let mut picked = Vec::with_capacity(self.batch_size);
        while picked.len() < self.batch_size {
            if self.cursor == self.order.len() {
                self.start_epoch();
            }
            picked.push(&examples[self.order[self.cursor]]);
            self.cursor += 1;
        }
        let (inputs, labels) = stack(picked, &self.spec)?;
        Ok(Some(Batch { inputs, labels }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> DataSpec {
        DataSpec {
            train_file: "train.jsonl".to_string(),
            val_file: "val.jsonl".to_string(),
            input_dim: 1,
            output_dim: 1,
        }
    }

    fn examples(n: usize) -> Arc<Vec<Example>> {
        #[allow(clippy::cast_precision_loss)]
        let v = (0..n).map(|i| Example { x: vec![i as f32], y: vec![0.0] }).collect();
        Arc::new(v)
    }

    #[test]
    fn test_epoch_covers_every_example_once() {
        let mut producer = CyclingProducer::new(examples(6), spec(), 3, true, 7);
        let mut seen: Vec<f32> = Vec::new();
        for _ in 0..2 {
            let batch = producer.next_batch().unwrap().unwrap();
            assert_eq!(batch.inputs.shape(), &[3, 1]);
            seen.extend_from_slice(batch.inputs.data());
        }
        seen.sort_by(f32::total_cmp);
        assert_eq!(seen, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_same_seed_same_order() {
        let mut a = CyclingProducer::new(examples(10), spec(), 4, true, 3);
        let mut b = CyclingProducer::new(examples(10), spec(), 4, true, 3);
        for _ in 0..5 {
            assert_eq!(a.next_batch().unwrap(), b.next_batch().unwrap());
        }
    }

    #[test]
    fn test_skip_matches_consumed_batches() {
        let mut consumed = CyclingProducer::new(examples(10), spec(), 4, true, 5);
        for _ in 0..7 {
            consumed.next_batch().unwrap();
        }
        let mut skipped = CyclingProducer::new(examples(10), spec(), 4, true, 5);
        skipped.skip_batches(7);
        for _ in 0..4 {
            assert_eq!(consumed.next_batch().unwrap(), skipped.next_batch().unwrap());
        }
    }

    #[test]
    fn test_batches_split_across_workers() {
        assert_eq!(batches_before(0, 0, 1), 0);
        assert_eq!(batches_before(9, 0, 1), 9);
        let shares: Vec<u64> = (0..3).map(|w| batches_before(8, w, 3)).collect();
        assert_eq!(shares, vec![3, 3, 2]);
        assert_eq!(shares.iter().sum::<u64>(), 8);
    }

    #[test]
    fn test_unshuffled_batches_wrap_around() {
        let mut producer = CyclingProducer::new(examples(3), spec(), 2, false, 0);
        producer.next_batch().unwrap();
        let second = producer.next_batch().unwrap().unwrap();
        assert_eq!(second.inputs.data(), &[2.0, 0.0]);
    }
}
