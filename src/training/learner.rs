use burn::module::{AutodiffModule, Module};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{GradientsAccumulator, GradientsParams, Optimizer, SgdConfig};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::activation::{log_softmax, softmax};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Int, Tensor};
use std::path::Path;

use crate::data::{BatchLabels, ImageBatch};
use crate::error::{Error, Result};
use crate::model::{DeviceStrategy, StyleNet};

/// Compute side of the training loop.
///
/// Implementations own the model parameters and the optimizer state; the
/// loop only ever hands them CPU batches.
pub trait Learner {
    /// Forward pass, loss, fresh gradients, backward pass and optimizer
    /// update, in that order. Returns the batch loss.
    fn train_step(&mut self, batch: &ImageBatch) -> Result<f64>;

    /// Batch loss with gradient tracking disabled.
    fn eval_loss(&self, batch: &ImageBatch) -> Result<f64>;

    /// Per-sample class probabilities.
    fn predict(&self, batch: &ImageBatch) -> Result<Vec<Vec<f32>>>;

    fn save(&self, path: &Path) -> Result<()>;

    fn load(&mut self, path: &Path) -> Result<()>;

    fn num_params(&self) -> usize;
}

/// Targets of a batch on a compute device.
pub enum Targets<B: Backend> {
    Classes(Tensor<B, 1, Int>),
    Probabilities(Tensor<B, 2>),
}

/// Moves a CPU batch onto `device`, checking labels against `num_classes`.
pub fn batch_tensors<B: Backend>(
    batch: &ImageBatch,
    num_classes: usize,
    device: &B::Device,
) -> Result<(Tensor<B, 4>, Targets<B>)> {
    let images = Tensor::<B, 1>::from_floats(batch.images.as_slice(), device).reshape(batch.shape);

    let targets = match &batch.labels {
        BatchLabels::Classes(classes) => {
            if let Some(&bad) = classes.iter().find(|&&c| c < 0 || c as usize >= num_classes) {
                return Err(Error::ShapeMismatch {
                    expected: vec![num_classes],
                    actual: vec![bad as usize + 1],
                });
            }
            Targets::Classes(Tensor::<B, 1, Int>::from_ints(classes.as_slice(), device))
        }
        BatchLabels::Distributions { values, width } => {
            if *width != num_classes {
                return Err(Error::ShapeMismatch {
                    expected: vec![batch.len(), num_classes],
                    actual: vec![batch.len(), *width],
                });
            }
            Targets::Probabilities(
                Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape([batch.len(), *width]),
            )
        }
    };

    Ok((images, targets))
}

/// Cross entropy against class indices or class-probability vectors.
pub fn cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Targets<B>) -> Result<Tensor<B, 1>> {
    let dims = logits.dims();
    match targets {
        Targets::Classes(classes) => {
            let [n] = classes.dims();
            if n != dims[0] {
                return Err(Error::ShapeMismatch {
                    expected: vec![dims[0]],
                    actual: vec![n],
                });
            }
            let loss_fn = CrossEntropyLossConfig::new().init(&logits.device());
            Ok(loss_fn.forward(logits, classes))
        }
        Targets::Probabilities(probs) => {
            if probs.dims() != dims {
                return Err(Error::ShapeMismatch {
                    expected: dims.to_vec(),
                    actual: probs.dims().to_vec(),
                });
            }
            Ok((probs * log_softmax(logits, 1)).sum_dim(1).mean().neg())
        }
    }
}

fn scalar<B: Backend>(loss: Tensor<B, 1>) -> f64 {
    loss.into_scalar().elem::<f64>()
}

/// Momentum SGD without dampening.
pub fn momentum_sgd<B: AutodiffBackend>(momentum: f64) -> impl Optimizer<StyleNet<B>, B> {
    SgdConfig::new()
        .with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(momentum)
                .with_dampening(0.0),
        ))
        .init::<B, StyleNet<B>>()
}

/// Burn-backed learner for [`StyleNet`].
pub struct StyleLearner<B: AutodiffBackend, O: Optimizer<StyleNet<B>, B>> {
    model: StyleNet<B>,
    optimizer: O,
    strategy: DeviceStrategy<B::Device>,
    num_classes: usize,
    learning_rate: f64,
}

impl<B, O> StyleLearner<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<StyleNet<B>, B>,
{
    pub fn new(
        model: StyleNet<B>,
        optimizer: O,
        strategy: DeviceStrategy<B::Device>,
        num_classes: usize,
        learning_rate: f64,
    ) -> Self {
        let model = model.fork(strategy.primary());
        Self {
            model,
            optimizer,
            strategy,
            num_classes,
            learning_rate,
        }
    }

    pub fn model(&self) -> &StyleNet<B> {
        &self.model
    }

    /// No-gradient logits for a whole batch, merged on the primary device.
    fn valid_logits(&self, batch: &ImageBatch) -> Result<(Tensor<B::InnerBackend, 2>, Targets<B::InnerBackend>)> {
        let model = self.model.valid();
        let primary = self.strategy.primary();

        let mut outputs = Vec::new();
        for (range, device) in self.strategy.shards(batch.len()) {
            let (images, _) = batch_tensors::<B::InnerBackend>(&batch.slice(range), self.num_classes, device)?;
            let logits = if device == primary {
                model.forward(images)
            } else {
                model.clone().to_device(device).forward(images).to_device(primary)
            };
            outputs.push(logits);
        }

        let (_, targets) = batch_tensors::<B::InnerBackend>(batch, self.num_classes, primary)?;
        Ok((Tensor::cat(outputs, 0), targets))
    }
}

impl<B, O> Learner for StyleLearner<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<StyleNet<B>, B>,
{
    fn train_step(&mut self, batch: &ImageBatch) -> Result<f64> {
        let primary = self.strategy.primary().clone();
        let shards = self.strategy.shards(batch.len());

        // Gradients come from this step's backward pass only; nothing
        // accumulates across steps.
        let (loss_value, grads) = if let [(_, device)] = shards.as_slice() {
            let (images, targets) = batch_tensors::<B>(batch, self.num_classes, device)?;
            let logits = self.model.forward(images);
            let loss = cross_entropy(logits, targets)?;
            let loss_value = scalar(loss.clone());
            (loss_value, GradientsParams::from_grads(loss.backward(), &self.model))
        } else {
            let total = batch.len() as f64;
            let mut accumulator = GradientsAccumulator::new();
            let mut loss_value = 0.0;

            for (range, device) in shards {
                let weight = range.len() as f64 / total;
                let replica = self.model.clone().fork(device);
                let (images, targets) = batch_tensors::<B>(&batch.slice(range), self.num_classes, device)?;
                let loss = cross_entropy(replica.forward(images), targets)?.mul_scalar(weight);
                loss_value += scalar(loss.clone());

                let grads = GradientsParams::from_grads(loss.backward(), &replica)
                    .to_device(&primary, &self.model);
                accumulator.accumulate(&self.model, grads);
            }
            (loss_value, accumulator.grads())
        };

        if !loss_value.is_finite() {
            return Err(Error::Device(format!("non-finite training loss {}", loss_value)));
        }

        self.model = self
            .optimizer
            .step(self.learning_rate, self.model.clone(), grads);
        Ok(loss_value)
    }

    fn eval_loss(&self, batch: &ImageBatch) -> Result<f64> {
        let (logits, targets) = self.valid_logits(batch)?;
        Ok(scalar(cross_entropy(logits, targets)?))
    }

    fn predict(&self, batch: &ImageBatch) -> Result<Vec<Vec<f32>>> {
        let (logits, _) = self.valid_logits(batch)?;
        let [_, classes] = logits.dims();
        let probs = softmax(logits, 1)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| Error::Device(format!("cannot read predictions: {:?}", e)))?;

        Ok(probs.chunks(classes).map(<[f32]>::to_vec).collect())
    }

    fn save(&self, path: &Path) -> Result<()> {
        NamedMpkFileRecorder::<FullPrecisionSettings>::new()
            .record(self.model.clone().into_record(), path.to_path_buf())
            .map_err(|e| Error::Checkpoint(format!("failed to save {:?}: {:?}", path, e)))
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let record = NamedMpkFileRecorder::<FullPrecisionSettings>::new()
            .load(path.to_path_buf(), self.strategy.primary())
            .map_err(|e| Error::Checkpoint(format!("failed to load {:?}: {:?}", path, e)))?;
        self.model = self
            .model
            .clone()
            .load_record(record)
            .fork(self.strategy.primary());
        Ok(())
    }

    fn num_params(&self) -> usize {
        self.model.num_params()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StyleNetConfig;
    use burn::backend::Autodiff;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn batch(labels: BatchLabels, n: usize) -> ImageBatch {
        ImageBatch {
            indices: (0..n).collect(),
            images: (0..n * 3 * 8 * 8).map(|i| (i % 17) as f32 / 17.0).collect(),
            shape: [n, 3, 8, 8],
            labels,
        }
    }

    fn model(num_classes: usize) -> StyleNet<TestBackend> {
        let config = StyleNetConfig {
            num_classes,
            channels: [4, 4, 8],
            dropout: 0.0,
        };
        StyleNet::new(&config, &Default::default()).unwrap()
    }

    fn learner_on(
        model: StyleNet<TestBackend>,
        strategy: DeviceStrategy<NdArrayDevice>,
        num_classes: usize,
        learning_rate: f64,
    ) -> StyleLearner<TestBackend, impl Optimizer<StyleNet<TestBackend>, TestBackend>> {
        StyleLearner::new(
            model,
            momentum_sgd::<TestBackend>(0.9),
            strategy,
            num_classes,
            learning_rate,
        )
    }

    fn learner(num_classes: usize) -> StyleLearner<TestBackend, impl Optimizer<StyleNet<TestBackend>, TestBackend>> {
        learner_on(model(num_classes), DeviceStrategy::SingleDevice(NdArrayDevice::Cpu), num_classes, 0.01)
    }

    /// Number of parameter tensors that receive a gradient from one backward pass.
    fn tracked_params<O: Optimizer<StyleNet<TestBackend>, TestBackend>>(
        learner: &StyleLearner<TestBackend, O>,
        batch: &ImageBatch,
    ) -> usize {
        let (images, targets) = batch_tensors::<TestBackend>(batch, learner.num_classes, &NdArrayDevice::Cpu).unwrap();
        let loss = cross_entropy(learner.model().forward(images), targets).unwrap();
        GradientsParams::from_grads(loss.backward(), learner.model()).len()
    }

    #[test]
    fn test_train_and_eval_class_labels() {
        let mut learner = learner(2);
        let batch = batch(BatchLabels::Classes(vec![0, 1, 1, 0]), 4);

        let loss = learner.train_step(&batch).unwrap();
        assert!(loss.is_finite() && loss > 0.0);

        let eval = learner.eval_loss(&batch).unwrap();
        assert!(eval.is_finite() && eval > 0.0);
    }

    #[test]
    fn test_distribution_labels_and_predictions() {
        let mut learner = learner(10);
        let mut values = vec![0.0f32; 20];
        values[0] = 1.0;
        values[19] = 1.0;
        let batch = batch(BatchLabels::Distributions { values, width: 10 }, 2);

        assert!(learner.train_step(&batch).unwrap().is_finite());

        let probs = learner.predict(&batch).unwrap();
        assert_eq!(probs.len(), 2);
        assert_eq!(probs[0].len(), 10);
        assert!((probs[0].iter().sum::<f32>() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_label_shape_mismatch_is_fatal() {
        let mut learner = learner(2);
        let wide = batch(BatchLabels::Distributions { values: vec![0.1; 30], width: 10 }, 3);
        assert!(matches!(learner.train_step(&wide), Err(Error::ShapeMismatch { .. })));

        let out_of_range = batch(BatchLabels::Classes(vec![0, 5]), 2);
        assert!(matches!(learner.eval_loss(&out_of_range), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_cross_entropy_with_one_hot_matches_class_index() {
        let device = Default::default();
        let logits = Tensor::<NdArray<f32>, 2>::from_floats([[2.0, 0.5], [0.1, 1.5]], &device);
        let by_index = cross_entropy(
            logits.clone(),
            Targets::Classes(Tensor::from_ints([0, 1], &device)),
        )
        .unwrap();
        let by_probs = cross_entropy(
            logits,
            Targets::Probabilities(Tensor::from_floats([[1.0, 0.0], [0.0, 1.0]], &device)),
        )
        .unwrap();

        assert!((scalar(by_index) - scalar(by_probs)).abs() < 1e-5);
    }

    #[test]
    fn test_save_load_restores_parameters() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("epoch-1-0.500000.mpk");
        let batch = batch(BatchLabels::Classes(vec![0, 1]), 2);

        let mut trained = learner(2);
        trained.train_step(&batch).unwrap();
        trained.save(&path).unwrap();
        let expected = trained.eval_loss(&batch).unwrap();

        let mut restored = learner(2);
        restored.load(&path).unwrap();
        assert!((restored.eval_loss(&batch).unwrap() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_parameters_track_gradients() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("epoch-0.mpk");
        let batch = batch(BatchLabels::Classes(vec![0, 1]), 2);
        // Three conv layers and the head, each with a weight and a bias.
        let expected = 8;

        let mut learner = learner(2);
        assert_eq!(tracked_params(&learner, &batch), expected);

        learner.train_step(&batch).unwrap();
        assert_eq!(tracked_params(&learner, &batch), expected);

        learner.save(&path).unwrap();
        learner.load(&path).unwrap();
        assert_eq!(tracked_params(&learner, &batch), expected);
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut learner = learner_on(model(2), DeviceStrategy::SingleDevice(NdArrayDevice::Cpu), 2, 0.05);
        let batch = batch(BatchLabels::Classes(vec![0, 0, 0, 0]), 4);

        let first = learner.eval_loss(&batch).unwrap();
        let losses: Vec<f64> = (0..20).map(|_| learner.train_step(&batch).unwrap()).collect();
        let last = learner.eval_loss(&batch).unwrap();

        assert!(losses[0] > losses[19]);
        assert!(last < first / 2.0, "loss went from {} to {}", first, last);
    }

    #[test]
    fn test_data_parallel_matches_single_device() {
        let initial = model(2);
        let batch = batch(BatchLabels::Classes(vec![0, 1, 1, 0]), 4);

        let mut single = learner_on(initial.clone(), DeviceStrategy::SingleDevice(NdArrayDevice::Cpu), 2, 0.05);
        let mut parallel = learner_on(
            initial,
            DeviceStrategy::DataParallel(vec![NdArrayDevice::Cpu, NdArrayDevice::Cpu]),
            2,
            0.05,
        );

        let single_loss = single.train_step(&batch).unwrap();
        let parallel_loss = parallel.train_step(&batch).unwrap();
        assert!((single_loss - parallel_loss).abs() < 1e-5);

        // Same update: both learners now score the batch identically.
        let single_eval = single.eval_loss(&batch).unwrap();
        let parallel_eval = parallel.eval_loss(&batch).unwrap();
        assert!((single_eval - single_loss).abs() > 1e-7);
        assert!((single_eval - parallel_eval).abs() < 1e-4);
    }
}
