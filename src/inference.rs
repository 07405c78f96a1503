use std::path::Path;
use tracing::{debug, info};

use crate::data::BatchIterator;
use crate::error::{Error, Result};
use crate::training::Learner;

/// Number of score ranks a test prediction is read over.
pub const SCORE_RANKS: usize = 10;

/// Summary of one test image's predicted rank distribution.
#[derive(Debug, Clone, PartialEq)]
pub struct ScorePrediction {
    pub index: usize,
    pub mean: f64,
    pub std: f64,
}

/// Mean and standard deviation of a score vector read as a distribution
/// over ranks `1..=scores.len()`.
pub fn score_stats(scores: &[f32]) -> (f64, f64) {
    let mean: f64 = scores
        .iter()
        .enumerate()
        .map(|(i, &p)| (i + 1) as f64 * p as f64)
        .sum();
    let variance: f64 = scores
        .iter()
        .enumerate()
        .map(|(i, &p)| p as f64 * ((i + 1) as f64 - mean).powi(2))
        .sum();
    (mean, variance.max(0.0).sqrt())
}

/// Runs the learner over every test batch in order. Each output row must
/// hold one probability per rank in `1..=SCORE_RANKS`.
pub fn run_test<L: Learner + ?Sized>(
    learner: &L,
    batches: &mut BatchIterator,
) -> Result<Vec<ScorePrediction>> {
    let mut predictions = Vec::with_capacity(batches.dataset_len());

    for batch in batches.pass() {
        let batch = batch?;
        let scores = learner.predict(&batch)?;
        for (&index, row) in batch.indices.iter().zip(&scores) {
            if row.len() != SCORE_RANKS {
                return Err(Error::ShapeMismatch {
                    expected: vec![SCORE_RANKS],
                    actual: vec![row.len()],
                });
            }
            let (mean, std) = score_stats(row);
            debug!("Image {}: mean {:.4}, std {:.4}", index, mean, std);
            predictions.push(ScorePrediction { index, mean, std });
        }
    }

    info!("Predicted scores for {} test images", predictions.len());
    Ok(predictions)
}

/// Writes `image_index,mean,std` rows with a header line.
pub fn write_predictions(path: &Path, predictions: &[ScorePrediction]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let csv_error = |e: csv::Error| Error::data(path, e.to_string());
    let mut out = csv::Writer::from_path(path).map_err(csv_error)?;
    out.write_record(["image_index", "mean", "std"]).map_err(csv_error)?;
    for p in predictions {
        out.write_record([
            p.index.to_string(),
            format!("{:.6}", p.mean),
            format!("{:.6}", p.std),
        ])
        .map_err(csv_error)?;
    }
    out.flush()?;

    info!("Predictions written to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BatchOrder, CountingDataset};
    use crate::training::tests::ScriptedLearner;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_point_mass_on_first_rank() {
        let mut scores = vec![0.0; 10];
        scores[0] = 1.0;
        let (mean, std) = score_stats(&scores);
        assert!(close(mean, 1.0));
        assert!(close(std, 0.0));
    }

    #[test]
    fn test_two_point_distribution() {
        let (mean, std) = score_stats(&[0.5, 0.5]);
        assert!(close(mean, 1.5));
        assert!(close(std, 0.5));
    }

    #[test]
    fn test_uniform_over_ten_ranks() {
        let (mean, std) = score_stats(&[0.1; 10]);
        assert!(close(mean, 5.5));
        assert!(close(std, 8.25f64.sqrt()));
    }

    #[test]
    fn test_run_test_keeps_dataset_order() {
        let learner = ScriptedLearner::new(vec![]);
        let mut batches = BatchIterator::new(
            Arc::new(CountingDataset { len: 5, fail_at: None }),
            2,
            BatchOrder::Sequential,
            1,
        );

        let predictions = run_test(&learner, &mut batches).unwrap();
        let indices: Vec<usize> = predictions.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert!(close(predictions[0].mean, 1.0));
        assert!(close(predictions[1].mean, 1.5));
        assert!(close(predictions[1].std, 0.5));
    }

    #[test]
    fn test_run_test_rejects_two_class_scores() {
        let mut learner = ScriptedLearner::new(vec![]);
        learner.score_width = 2;
        let mut batches = BatchIterator::new(
            Arc::new(CountingDataset { len: 3, fail_at: None }),
            2,
            BatchOrder::Sequential,
            0,
        );

        match run_test(&learner, &mut batches) {
            Err(Error::ShapeMismatch { expected, actual }) => {
                assert_eq!(expected, vec![SCORE_RANKS]);
                assert_eq!(actual, vec![2]);
            }
            other => panic!("expected ShapeMismatch, got {:?}", other.map(|p| p.len())),
        }
    }

    #[test]
    fn test_write_predictions_csv() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("preds.csv");
        let predictions = vec![
            ScorePrediction { index: 0, mean: 1.0, std: 0.0 },
            ScorePrediction { index: 7, mean: 5.5, std: 2.5 },
        ];

        write_predictions(&path, &predictions).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "image_index,mean,std\n0,1.000000,0.000000\n7,5.500000,2.500000\n"
        );
    }
}
