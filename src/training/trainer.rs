use std::path::PathBuf;
use tracing::{info, warn};

use super::evaluator::{loss_denominator, Evaluator};
use super::learner::Learner;
use super::metrics::MetricsSink;
use crate::checkpoint::CheckpointManager;
use crate::config::TrainingConfig;
use crate::data::BatchIterator;
use crate::error::Result;

/// A validation pass runs after every this many training steps.
pub const SUB_EPOCH_PERIOD: usize = 4;

/// Divisor deriving the epoch label of a sub-epoch checkpoint from the
/// 1-based step index. Existing checkpoint names use it; it is not the
/// true epoch.
pub const PSEUDO_EPOCH_DIVISOR: usize = 6;

/// Epoch label of the sub-epoch checkpoint taken after step `step_index`
/// (0-based).
pub fn pseudo_epoch(step_index: usize) -> usize {
    (step_index + 1) / PSEUDO_EPOCH_DIVISOR
}

/// Mutable bookkeeping of one training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    /// Current 1-based epoch, 0 before the first epoch starts.
    pub epoch: usize,
    /// Training steps taken in this run.
    pub step: usize,
    pub best_val_loss: f64,
    /// Consecutive epoch-end validations without improvement.
    pub patience_count: usize,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            epoch: 0,
            step: 0,
            best_val_loss: f64::INFINITY,
            patience_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    PatienceExhausted,
    MaxEpochsReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    RunningEpoch(usize),
    Stopped(StopReason),
}

/// Which epochs to run and when to give up.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    /// Exclusive upper bound of the 0-based epoch index.
    pub epochs: usize,
    pub patience: usize,
    /// Epoch whose snapshot is restored before training; training resumes
    /// at the following epoch.
    pub warm_start: Option<usize>,
}

impl Schedule {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            epochs: config.epochs,
            patience: config.early_stopping_patience,
            warm_start: config.warm_start.then_some(config.warm_start_epoch),
        }
    }

    pub fn start_epoch(&self) -> usize {
        self.warm_start.unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub stop_reason: StopReason,
    pub epochs_run: usize,
    pub best_val_loss: f64,
    /// Mean training loss of each epoch run.
    pub train_losses: Vec<f64>,
    /// Epoch-end validation loss of each epoch run.
    pub val_losses: Vec<f64>,
    /// Every snapshot written, in order.
    pub checkpoints: Vec<PathBuf>,
}

/// Drives epochs and steps, periodic validation, checkpointing and early
/// stopping over a [`Learner`].
pub struct TrainingLoop<L: Learner, S: MetricsSink> {
    learner: L,
    train: BatchIterator,
    evaluator: Evaluator,
    checkpoints: CheckpointManager,
    sink: S,
    schedule: Schedule,
    state: TrainingState,
    phase: Phase,
    written: Vec<PathBuf>,
}

impl<L: Learner, S: MetricsSink> TrainingLoop<L, S> {
    pub fn new(
        learner: L,
        train: BatchIterator,
        evaluator: Evaluator,
        checkpoints: CheckpointManager,
        sink: S,
        schedule: Schedule,
    ) -> Self {
        Self {
            learner,
            train,
            evaluator,
            checkpoints,
            sink,
            schedule,
            state: TrainingState::default(),
            phase: Phase::Idle,
            written: Vec::new(),
        }
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn learner(&self) -> &L {
        &self.learner
    }

    pub fn into_learner(self) -> L {
        self.learner
    }

    pub fn run(&mut self) -> Result<RunSummary> {
        if let Some(epoch) = self.schedule.warm_start {
            self.checkpoints.load(&mut self.learner, epoch)?;
        }

        let nominal_steps = loss_denominator(self.train.dataset_len(), self.train.batch_size());
        let mut train_losses = Vec::new();
        let mut val_losses = Vec::new();
        let mut stop_reason = StopReason::MaxEpochsReached;

        info!(
            "Training epochs {}..={} ({} batches per epoch, patience {})",
            self.schedule.start_epoch() + 1,
            self.schedule.epochs,
            self.train.num_batches(),
            self.schedule.patience
        );

        for epoch in self.schedule.start_epoch()..self.schedule.epochs {
            self.state.epoch = epoch + 1;
            self.phase = Phase::RunningEpoch(epoch + 1);

            let loss_sum = self.run_epoch(epoch, nominal_steps)?;
            let avg_loss = loss_sum / nominal_steps as f64;
            train_losses.push(avg_loss);
            info!("Epoch {} mean training loss: {:.4}", epoch + 1, avg_loss);

            let val_loss = self.evaluator.evaluate(&self.learner)?;
            val_losses.push(val_loss);
            info!(
                "Epoch {} completed. Mean loss on val set: {:.4}.",
                epoch + 1,
                val_loss
            );
            self.sink.add_scalars(
                "epoch losses",
                &[("epoch train loss", avg_loss), ("epoch val loss", val_loss)],
                epoch + 1,
            )?;

            let path = self.checkpoints.save(&self.learner, epoch + 1, val_loss)?;
            self.written.push(path);

            if val_loss < self.state.best_val_loss {
                self.state.best_val_loss = val_loss;
                self.state.patience_count = 0;
            } else if val_loss.is_nan() {
                warn!("Epoch {} val loss is NaN; patience unchanged", epoch + 1);
            } else {
                self.state.patience_count += 1;
                if self.state.patience_count == self.schedule.patience {
                    info!(
                        "Val loss has not decreased in {} epochs. Training terminated.",
                        self.schedule.patience
                    );
                    stop_reason = StopReason::PatienceExhausted;
                    break;
                }
            }
        }

        self.phase = Phase::Stopped(stop_reason);
        info!("Training completed ({:?}).", stop_reason);

        Ok(RunSummary {
            stop_reason,
            epochs_run: train_losses.len(),
            best_val_loss: self.state.best_val_loss,
            train_losses,
            val_losses,
            checkpoints: self.written.clone(),
        })
    }

    /// One pass over the training split; returns the summed step losses.
    fn run_epoch(&mut self, epoch: usize, nominal_steps: usize) -> Result<f64> {
        let mut loss_sum = 0.0;

        for (i, batch) in self.train.pass().enumerate() {
            let batch = batch?;
            let loss = self.learner.train_step(&batch)?;
            self.state.step += 1;
            loss_sum += loss;

            info!(
                "Epoch: {}/{} | Step: {}/{} | Training loss: {:.4}",
                epoch + 1,
                self.schedule.epochs,
                i + 1,
                nominal_steps,
                loss
            );
            self.sink
                .add_scalar("batch train loss", loss, i + epoch * nominal_steps)?;

            if (i + 1) % SUB_EPOCH_PERIOD == 0 {
                self.sub_epoch_validation(i)?;
            }
        }

        Ok(loss_sum)
    }

    /// Validation inside an epoch. Saves a snapshot only on improvement and
    /// leaves the patience counter alone.
    fn sub_epoch_validation(&mut self, step_index: usize) -> Result<()> {
        let val_loss = self.evaluator.evaluate(&self.learner)?;
        let label = pseudo_epoch(step_index);
        info!(
            "Step {} validation (checkpoint epoch {}): mean val loss {:.4}",
            step_index + 1,
            label,
            val_loss
        );

        if val_loss < self.state.best_val_loss {
            self.state.best_val_loss = val_loss;
            info!("Saving model...");
            let path = self.checkpoints.save(&self.learner, label, val_loss)?;
            self.written.push(path);
        }
        Ok(())
    }
}
