use crate::pool::Loader;
use anyhow::{Context, Result};
use minibatch::BatchDescriptor;
use std::sync::Arc;

/// Read-only, fully loaded data that batches are gathered from.
///
/// Implementations are shared by every worker of a pool without locking, so
/// `gather` must not mutate anything.
pub trait BackingData: Send + Sync + 'static {
    /// What one gather produces.
    type Gathered: Send + 'static;

    /// Size of axis A.
    fn n_cells(&self) -> usize;

    /// Size of axis B.
    fn n_genes(&self) -> usize;

    /// Gather the `cells` x `genes` block.
    fn gather(&self, cells: &[usize], genes: &[usize]) -> Result<Self::Gathered>;
}

/// Loader that gathers straight from a shared [`BackingData`].
pub struct GatherLoader<D> {
    data: Arc<D>,
}

impl<D: BackingData> GatherLoader<D> {
    /// Loader factory; pass it as-is to [`crate::LoaderPool::new`].
    pub fn new(data: &Arc<D>) -> Result<Self> {
        Ok(GatherLoader {
            data: Arc::clone(data),
        })
    }
}

impl<D: BackingData> Loader for GatherLoader<D> {
    type Payload = D::Gathered;

    fn load(&mut self, descriptor: &BatchDescriptor) -> Result<D::Gathered> {
        self.data
            .gather(&descriptor.cells, &descriptor.genes)
            .with_context(|| format!("gathering batch #{}", descriptor.seq))
    }
}
