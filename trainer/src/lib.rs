//! Minibatch training and evaluation driver.
//!
//! [`train`] pulls batches from a training [`loader_pool::LoaderPool`],
//! updates a [`Model`] through an [`Optimizer`], and at every checkpoint
//! drains a validation pool while the registered [`CheckpointHook`]s collect
//! statistics. Both pools are terminated on every exit path.
#![deny(missing_docs)]

mod error;
mod hooks;
mod model;
mod optim;
mod poisson;
mod session;
mod trace;
mod train;

pub use error::{TrainError, TrainErrorKind};
pub use hooks::{CheckpointHook, KeyedAccumulatorHook};
pub use model::{Loss, Model, Optimizer, Parameters};
pub use optim::{Adam, Sgd};
pub use poisson::{PoissonLoss, PoissonRateModel};
pub use session::TrainingSession;
pub use trace::{BatchLoss, CheckpointRecord, RunningMean, StepRecord, TrainerState, TrainingTrace};
pub use train::{evaluate, train, StopSignal, TrainConfig};
