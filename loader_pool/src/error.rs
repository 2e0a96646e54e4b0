use minibatch::BatchDescriptor;
use std::fmt;

/// Lifecycle of a [`crate::LoaderPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Workers are running but no plan has been assigned yet.
    Uninitialized,
    /// A plan is queued; batches can be pulled.
    Ready,
    /// A batch failed to materialize. Only `terminate` is allowed.
    Failed,
    /// Workers have been joined.
    Terminated,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolState::Uninitialized => "uninitialized",
            PoolState::Ready => "ready",
            PoolState::Failed => "failed",
            PoolState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Errors raised by a loader pool.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("a loader pool needs at least one worker")]
    NoWorkers,

    #[error("failed to construct the loader for worker {worker}")]
    LoaderInit {
        worker: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "failed to materialize batch #{} ({} cells x {} genes)",
        .descriptor.seq,
        .descriptor.n_cells(),
        .descriptor.n_genes()
    )]
    BatchMaterialization {
        descriptor: Box<BatchDescriptor>,
        #[source]
        source: anyhow::Error,
    },

    #[error("cannot {operation} a loader pool that is {state}")]
    Lifecycle {
        operation: &'static str,
        state: PoolState,
    },

    #[error("all loader workers exited with batches still outstanding")]
    WorkersExited,
}

impl PoolError {
    /// The descriptor of the batch that failed, if this is a materialization error.
    pub fn descriptor(&self) -> Option<&BatchDescriptor> {
        match self {
            PoolError::BatchMaterialization { descriptor, .. } => Some(descriptor),
            _ => None,
        }
    }
}
