//! Loss history of a training run.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Accumulates a mean over observations.
///
/// # Example
/// ```rust
/// use trainer::RunningMean;
/// let mut m = RunningMean::default();
/// assert_eq!(m.mean(), None);
/// m.record(1.0);
/// m.record(3.0);
/// assert!((m.mean().unwrap() - 2.0).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMean {
    numerator: f64,
    denominator: usize,
}

impl RunningMean {
    /// Add one observation.
    pub fn record(&mut self, value: f64) {
        self.numerator += value;
        self.denominator += 1;
    }

    /// `None` until something has been recorded.
    pub fn mean(&self) -> Option<f64> {
        (self.denominator > 0).then(|| self.numerator / self.denominator as f64)
    }
}

/// Loss of a single minibatch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    #[allow(missing_docs)]
    pub epoch: usize,
    /// Position of the batch within its pass.
    pub step: usize,
    /// Index of the checkpoint this step counts towards.
    pub checkpoint: usize,
    /// Sequence number of the batch descriptor.
    pub batch: usize,
    #[allow(missing_docs)]
    pub loss: f64,
}

/// Summary written when a checkpoint completes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Index of the checkpoint, counting from zero.
    pub checkpoint: usize,
    /// Epoch whose end triggered the checkpoint.
    pub epoch: usize,
    /// Optimizer steps taken so far in the run.
    pub n_steps: usize,
    /// Mean training loss since the previous checkpoint.
    pub train_loss: Option<f64>,
    /// Mean validation loss; `None` if the validation plan was empty.
    pub validation_loss: Option<f64>,
}

/// Where the training loop is, or where it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerState {
    /// `train` has not been called.
    #[default]
    NotStarted,
    /// In a training epoch.
    Running,
    /// Draining the validation pool and running hooks.
    Checkpointing,
    /// Every epoch completed.
    Finished,
    /// A stop request ended the run early.
    Cancelled,
    /// An error ended the run.
    Failed,
}

/// Loss of one batch from an inference pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct BatchLoss {
    pub batch: usize,
    pub loss: f64,
}

/// Everything recorded over a run. Partial if the run was cancelled or failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingTrace {
    /// One record per training batch.
    pub train_steps: Vec<StepRecord>,
    /// One record per validation batch of every completed checkpoint.
    pub validation_steps: Vec<StepRecord>,
    /// Completed checkpoints in order.
    pub checkpoints: Vec<CheckpointRecord>,
    /// Where the run is, or how it ended.
    pub state: TrainerState,
}

fn mean_by_checkpoint(steps: &[StepRecord]) -> BTreeMap<usize, f64> {
    steps
        .iter()
        .into_group_map_by(|s| s.checkpoint)
        .into_iter()
        .map(|(checkpoint, group)| {
            let mut mean = RunningMean::default();
            group.iter().for_each(|s| mean.record(s.loss));
            (checkpoint, mean.mean().unwrap_or(f64::NAN))
        })
        .collect()
}

impl TrainingTrace {
    /// Mean training loss of the steps leading up to each checkpoint.
    pub fn train_loss_by_checkpoint(&self) -> BTreeMap<usize, f64> {
        mean_by_checkpoint(&self.train_steps)
    }

    /// Mean validation loss at each checkpoint.
    pub fn validation_loss_by_checkpoint(&self) -> BTreeMap<usize, f64> {
        mean_by_checkpoint(&self.validation_steps)
    }

    /// The checkpoint with the lowest validation loss.
    pub fn best_checkpoint(&self) -> Option<&CheckpointRecord> {
        self.checkpoints
            .iter()
            .filter(|c| c.validation_loss.is_some_and(|l| !l.is_nan()))
            .min_by(|a, b| {
                a.validation_loss
                    .partial_cmp(&b.validation_loss)
                    .unwrap_or(Ordering::Equal)
            })
    }

    /// Index of the most recent completed checkpoint.
    pub fn last_checkpoint(&self) -> Option<usize> {
        self.checkpoints.last().map(|c| c.checkpoint)
    }
}
