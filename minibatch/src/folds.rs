use crate::bins::{PartitionPlan, create_bins_ordered, create_bins_random};
use crate::error::ConfigurationError;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

/// A train/validation split of the cells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fold {
    /// Cells used for optimization, sorted.
    pub cells_train: Vec<usize>,
    /// Held out cells, sorted.
    pub cells_validation: Vec<usize>,
}

/// Split `0..n_cells` into `n_folds` folds. The cells are permuted with `seed`
/// and cut into `n_folds` near equal parts; fold `i` validates on part `i` and
/// trains on the rest.
pub fn generate_folds(
    n_cells: usize,
    n_folds: usize,
    seed: u64,
) -> Result<Vec<Fold>, ConfigurationError> {
    if n_folds < 2 || n_folds > n_cells {
        return Err(ConfigurationError::InvalidFolds { n_cells, n_folds });
    }
    let mut cells: Vec<usize> = (0..n_cells).collect();
    cells.shuffle(&mut ChaCha20Rng::seed_from_u64(seed));

    let bounds: Vec<usize> = (0..=n_folds).map(|i| i * n_cells / n_folds).collect();
    let folds = bounds
        .windows(2)
        .map(|w| {
            let mut cells_validation = cells[w[0]..w[1]].to_vec();
            let mut cells_train: Vec<usize> = cells[..w[0]]
                .iter()
                .chain(&cells[w[1]..])
                .copied()
                .collect();
            cells_validation.sort_unstable();
            cells_train.sort_unstable();
            Fold {
                cells_train,
                cells_validation,
            }
        })
        .collect();
    Ok(folds)
}

/// Batch sizes along both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinSteps {
    /// Maximum number of cells per batch.
    pub n_cells_step: usize,
    /// Maximum number of genes per batch.
    pub n_genes_step: usize,
}

/// The plans needed to train and validate on one fold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldPlans {
    /// Randomized plan over the training cells.
    pub train: PartitionPlan,
    /// Ordered plan over the validation cells.
    pub validation: PartitionPlan,
    /// The first few validation batches, for cheap loss tracing.
    pub validation_trace: PartitionPlan,
}

impl FoldPlans {
    /// Build the plans for `fold` over the given genes. `n_trace` is clamped to
    /// at least one batch.
    pub fn build(
        fold: &Fold,
        genes: &[usize],
        n_genes: usize,
        steps: BinSteps,
        permute_genes: bool,
        n_trace: usize,
        seed: Option<u64>,
    ) -> Result<FoldPlans, ConfigurationError> {
        let train = create_bins_random(
            &fold.cells_train,
            genes,
            n_genes,
            steps.n_cells_step,
            steps.n_genes_step,
            true,
            permute_genes,
            seed,
        )?;
        let validation = create_bins_ordered(
            &fold.cells_validation,
            genes,
            n_genes,
            steps.n_cells_step,
            steps.n_genes_step,
        )?;
        let validation_trace = validation.truncated(n_trace.max(1));
        Ok(FoldPlans {
            train,
            validation,
            validation_trace,
        })
    }
}
