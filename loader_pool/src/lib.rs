//! Parallel batch materialization
#![deny(missing_docs)]

mod backing;
mod error;
mod matrix;
mod pool;

pub use backing::{BackingData, GatherLoader};
pub use error::{PoolError, PoolState};
pub use matrix::{CountBatch, CountMatrix};
pub use pool::{Batch, Batches, Loader, LoaderPool};
