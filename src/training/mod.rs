pub mod evaluator;
pub mod learner;
pub mod metrics;
pub mod trainer;

pub use evaluator::{loss_denominator, Evaluator};
pub use learner::{batch_tensors, cross_entropy, momentum_sgd, Learner, StyleLearner, Targets};
pub use metrics::{FanoutSink, JsonlSink, MetricsSink, TracingSink};
pub use trainer::{Phase, RunSummary, Schedule, StopReason, TrainingLoop, TrainingState};

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::ImageBatch;
    use crate::error::{Error, Result};
    use std::cell::Cell;
    use std::fs;
    use std::path::{Path, PathBuf};

    /// Learner with a constant training loss and a scripted sequence of
    /// validation losses, one per validation pass. The last entry repeats.
    /// Predictions put all mass on rank 1 for even indices and split it
    /// over ranks 1 and 2 for odd ones.
    pub(crate) struct ScriptedLearner {
        pub val_losses: Vec<f64>,
        pub train_loss: f64,
        pub batches_per_pass: usize,
        pub eval_calls: Cell<usize>,
        pub steps: Cell<usize>,
        pub fail_at_step: Option<usize>,
        pub loaded: Option<PathBuf>,
        pub score_width: usize,
    }

    impl ScriptedLearner {
        pub fn new(val_losses: Vec<f64>) -> Self {
            Self {
                val_losses,
                train_loss: 1.0,
                batches_per_pass: 1,
                eval_calls: Cell::new(0),
                steps: Cell::new(0),
                fail_at_step: None,
                loaded: None,
                score_width: 10,
            }
        }
    }

    impl Learner for ScriptedLearner {
        fn train_step(&mut self, _batch: &ImageBatch) -> Result<f64> {
            if self.fail_at_step == Some(self.steps.get()) {
                return Err(Error::Device("non-finite loss".to_string()));
            }
            self.steps.set(self.steps.get() + 1);
            Ok(self.train_loss)
        }

        fn eval_loss(&self, _batch: &ImageBatch) -> Result<f64> {
            let calls = self.eval_calls.get();
            self.eval_calls.set(calls + 1);
            let pass = calls / self.batches_per_pass;
            Ok(self
                .val_losses
                .get(pass)
                .or(self.val_losses.last())
                .copied()
                .unwrap_or(1.0))
        }

        fn predict(&self, batch: &ImageBatch) -> Result<Vec<Vec<f32>>> {
            Ok(batch
                .indices
                .iter()
                .map(|&i| {
                    let mut row = vec![0.0; self.score_width];
                    if i % 2 == 0 {
                        row[0] = 1.0;
                    } else {
                        row[0] = 0.5;
                        row[1] = 0.5;
                    }
                    row
                })
                .collect())
        }

        fn save(&self, path: &Path) -> Result<()> {
            fs::write(path, b"scripted")?;
            Ok(())
        }

        fn load(&mut self, path: &Path) -> Result<()> {
            self.loaded = Some(path.to_path_buf());
            Ok(())
        }

        fn num_params(&self) -> usize {
            1_500_000
        }
    }

    /// Keeps every event in memory.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub scalars: Vec<(String, f64, usize)>,
        pub grouped: Vec<(String, Vec<(String, f64)>, usize)>,
    }

    impl MetricsSink for RecordingSink {
        fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
            self.scalars.push((tag.to_string(), value, step));
            Ok(())
        }

        fn add_scalars(&mut self, tag: &str, values: &[(&str, f64)], step: usize) -> Result<()> {
            let values = values
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect();
            self.grouped.push((tag.to_string(), values, step));
            Ok(())
        }
    }
}
