use crate::trace::TrainingTrace;
use loader_pool::PoolError;
use minibatch::BatchDescriptor;
use thiserror::Error;

/// What went wrong inside the training loop.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum TrainErrorKind {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("model failed on batch #{batch}")]
    Model {
        batch: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("checkpoint hook {hook} failed")]
    Hook {
        hook: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid training configuration: {0}")]
    Config(String),
}

/// A failed run, carrying what was recorded before the failure.
#[derive(Debug, Error)]
#[error(
    "training failed (last completed checkpoint: {})",
    .last_checkpoint.map_or_else(|| "none".to_string(), |c| c.to_string())
)]
pub struct TrainError {
    /// The failure itself.
    #[source]
    pub kind: TrainErrorKind,
    /// Index of the last checkpoint that completed, `None` if none did.
    pub last_checkpoint: Option<usize>,
    /// Everything recorded up to the failure, in state
    /// [`crate::TrainerState::Failed`].
    pub trace: TrainingTrace,
}

impl TrainError {
    pub(crate) fn new(kind: TrainErrorKind, trace: TrainingTrace) -> Self {
        TrainError {
            kind,
            last_checkpoint: trace.last_checkpoint(),
            trace,
        }
    }

    /// The batch that failed to materialize, if that is what stopped the run.
    pub fn descriptor(&self) -> Option<&BatchDescriptor> {
        match &self.kind {
            TrainErrorKind::Pool(e) => e.descriptor(),
            _ => None,
        }
    }

    /// The failure and all of its sources on one line.
    pub(crate) fn cause_chain(&self) -> String {
        let mut msg = self.kind.to_string();
        let mut source = std::error::Error::source(&self.kind);
        while let Some(s) = source {
            msg.push_str(": ");
            msg.push_str(&s.to_string());
            source = s.source();
        }
        msg
    }
}
