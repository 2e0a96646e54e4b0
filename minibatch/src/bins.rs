use crate::error::{Axis, ConfigurationError};
use itertools::Itertools;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

/// One unit of work: a subset of cells crossed with a subset of genes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchDescriptor {
    /// Position of this descriptor in the plan that created it.
    pub seq: usize,
    /// Axis A indices, never empty.
    pub cells: Vec<usize>,
    /// Axis B indices, never empty.
    pub genes: Vec<usize>,
}

impl BatchDescriptor {
    /// Number of cells in the batch.
    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    /// Number of genes in the batch.
    pub fn n_genes(&self) -> usize {
        self.genes.len()
    }
}

/// The ordered sequence of batches covering one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    descriptors: Vec<BatchDescriptor>,
    cells: Vec<usize>,
    genes: Vec<usize>,
    n_genes: usize,
}

impl PartitionPlan {
    /// The batch descriptors, in plan order.
    pub fn descriptors(&self) -> &[BatchDescriptor] {
        &self.descriptors
    }

    /// Number of batches in one pass over the plan.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// True if the plan has no batches. Plans built by [`create_bins`] never are.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// The full cell index set the plan was built from.
    pub fn cells(&self) -> &[usize] {
        &self.cells
    }

    /// The full gene index set the plan was built from.
    pub fn genes(&self) -> &[usize] {
        &self.genes
    }

    /// Size of the gene axis of the backing data.
    pub fn n_genes(&self) -> usize {
        self.n_genes
    }

    /// Keep only the first `n` batches. Used to trace validation loss on a
    /// cheap subset of the validation plan.
    pub fn truncated(&self, n: usize) -> PartitionPlan {
        PartitionPlan {
            descriptors: self.descriptors.iter().take(n).cloned().collect(),
            cells: self.cells.clone(),
            genes: self.genes.clone(),
            n_genes: self.n_genes,
        }
    }
}

fn rng_from(seed: Option<u64>) -> ChaCha20Rng {
    match seed {
        Some(seed) => ChaCha20Rng::seed_from_u64(seed),
        None => ChaCha20Rng::from_entropy(),
    }
}

fn chunk(
    indices: &[usize],
    step: usize,
    use_all: bool,
    axis: Axis,
) -> Result<Vec<Vec<usize>>, ConfigurationError> {
    let mut chunks: Vec<Vec<usize>> = indices.chunks(step).map(<[usize]>::to_vec).collect();
    if !use_all && chunks.last().is_some_and(|last| last.len() < step) {
        chunks.pop();
    }
    if chunks.is_empty() {
        return Err(ConfigurationError::NoCompleteChunk {
            axis,
            n_items: indices.len(),
            step,
        });
    }
    Ok(chunks)
}

/// Cross contiguous chunks of `cells` with contiguous chunks of `genes`.
///
/// Chunks hold at most `n_cells_step` cells and `n_genes_step` genes. With
/// `use_all` the trailing partial chunk of each axis is kept, so every index
/// lands in exactly one chunk; without it the partial chunk is dropped.
///
/// Descriptors are ordered gene chunk major. With `permute_genes` the gene
/// chunk order is shuffled: reproducibly if `seed` is set, freshly on every
/// call otherwise. Cell order is taken as given.
#[allow(clippy::too_many_arguments)]
pub fn create_bins(
    cells: &[usize],
    genes: &[usize],
    n_genes: usize,
    n_cells_step: usize,
    n_genes_step: usize,
    use_all: bool,
    permute_genes: bool,
    seed: Option<u64>,
) -> Result<PartitionPlan, ConfigurationError> {
    if cells.is_empty() {
        return Err(ConfigurationError::EmptyIndexSet { axis: Axis::Cells });
    }
    if genes.is_empty() {
        return Err(ConfigurationError::EmptyIndexSet { axis: Axis::Genes });
    }
    if n_cells_step == 0 {
        return Err(ConfigurationError::ZeroStep { axis: Axis::Cells });
    }
    if n_genes_step == 0 {
        return Err(ConfigurationError::ZeroStep { axis: Axis::Genes });
    }
    if let Some(&index) = genes.iter().find(|&&gene| gene >= n_genes) {
        return Err(ConfigurationError::IndexOutOfRange {
            axis: Axis::Genes,
            index,
            size: n_genes,
        });
    }

    let cell_chunks = chunk(cells, n_cells_step, use_all, Axis::Cells)?;
    let mut gene_chunks = chunk(genes, n_genes_step, use_all, Axis::Genes)?;
    if permute_genes {
        gene_chunks.shuffle(&mut rng_from(seed));
    }

    let descriptors = gene_chunks
        .iter()
        .cartesian_product(cell_chunks.iter())
        .enumerate()
        .map(|(seq, (genes, cells))| BatchDescriptor {
            seq,
            cells: cells.clone(),
            genes: genes.clone(),
        })
        .collect();

    Ok(PartitionPlan {
        descriptors,
        cells: cells.to_vec(),
        genes: genes.to_vec(),
        n_genes,
    })
}

/// Like [`create_bins`], but the cells are permuted before chunking so that
/// every batch draws cells from the whole set. A fixed `seed` makes both the
/// cell permutation and the gene chunk order reproducible.
#[allow(clippy::too_many_arguments)]
pub fn create_bins_random(
    cells: &[usize],
    genes: &[usize],
    n_genes: usize,
    n_cells_step: usize,
    n_genes_step: usize,
    use_all: bool,
    permute_genes: bool,
    seed: Option<u64>,
) -> Result<PartitionPlan, ConfigurationError> {
    let mut rng = rng_from(seed);
    let mut shuffled = cells.to_vec();
    shuffled.shuffle(&mut rng);
    let gene_seed = seed.map(|seed| seed.wrapping_add(1));
    let mut plan = create_bins(
        &shuffled,
        genes,
        n_genes,
        n_cells_step,
        n_genes_step,
        use_all,
        permute_genes,
        gene_seed,
    )?;
    // the plan reports the index set it was asked for, not the permutation
    plan.cells = cells.to_vec();
    Ok(plan)
}

/// Deterministic plan covering every cell and gene, in the given order.
pub fn create_bins_ordered(
    cells: &[usize],
    genes: &[usize],
    n_genes: usize,
    n_cells_step: usize,
    n_genes_step: usize,
) -> Result<PartitionPlan, ConfigurationError> {
    create_bins(
        cells,
        genes,
        n_genes,
        n_cells_step,
        n_genes_step,
        true,
        false,
        None,
    )
}

/// Keep the indices whose entry in `mask` is set. `mask` is indexed by the
/// index value, so it must cover the whole axis.
pub fn select_masked(indices: &[usize], mask: &[bool]) -> Result<Vec<usize>, ConfigurationError> {
    let mut selected = Vec::with_capacity(indices.len());
    for &index in indices {
        match mask.get(index) {
            Some(true) => selected.push(index),
            Some(false) => {}
            None => {
                return Err(ConfigurationError::MaskTooShort {
                    mask_len: mask.len(),
                    index,
                })
            }
        }
    }
    Ok(selected)
}
