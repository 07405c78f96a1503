use tracing::debug;

use super::learner::Learner;
use crate::data::BatchIterator;
use crate::error::Result;

/// Denominator of every mean loss in a run: `M / B + 1`.
///
/// This is one more than the batch count whenever `B` divides `M`, so the
/// reported mean is then below the arithmetic mean. Existing checkpoint
/// names embed losses reduced this way.
pub fn loss_denominator(dataset_len: usize, batch_size: usize) -> usize {
    dataset_len / batch_size + 1
}

/// Full no-gradient pass over one split, reduced to a mean loss.
pub struct Evaluator {
    batches: BatchIterator,
}

impl Evaluator {
    pub fn new(batches: BatchIterator) -> Self {
        Self { batches }
    }

    pub fn evaluate<L: Learner + ?Sized>(&mut self, learner: &L) -> Result<f64> {
        let mut total = 0.0;
        let mut batches = 0;
        for batch in self.batches.pass() {
            total += learner.eval_loss(&batch?)?;
            batches += 1;
        }

        let denominator = loss_denominator(self.batches.dataset_len(), self.batches.batch_size());
        debug!(
            "Evaluated {} batches, summed loss {:.6}, denominator {}",
            batches, total, denominator
        );
        Ok(total / denominator as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BatchOrder, CountingDataset};
    use crate::training::tests::ScriptedLearner;
    use std::sync::Arc;

    fn evaluator(len: usize, batch_size: usize) -> Evaluator {
        Evaluator::new(BatchIterator::new(
            Arc::new(CountingDataset { len, fail_at: None }),
            batch_size,
            BatchOrder::Sequential,
            0,
        ))
    }

    #[test]
    fn test_denominator_formula() {
        assert_eq!(loss_denominator(100, 30), 4);
        assert_eq!(loss_denominator(90, 30), 4);
        assert_eq!(loss_denominator(3, 4), 1);
    }

    #[test]
    fn test_uneven_split_is_arithmetic_mean() {
        // 100 samples in batches of 30: 4 batches, denominator 4.
        let learner = ScriptedLearner::new(vec![0.8]);
        let loss = evaluator(100, 30).evaluate(&learner).unwrap();
        assert!((loss - 0.8).abs() < 1e-12);
        assert_eq!(learner.eval_calls.get(), 4);
    }

    #[test]
    fn test_even_split_undercounts() {
        // 90 samples in batches of 30: 3 batches but denominator 4.
        let learner = ScriptedLearner::new(vec![0.8]);
        let loss = evaluator(90, 30).evaluate(&learner).unwrap();
        assert!((loss - 0.6).abs() < 1e-12);
        assert_eq!(learner.eval_calls.get(), 3);
    }
}
