use crate::backing::BackingData;
use anyhow::{bail, ensure, Result};
use ndarray::{Array2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Poisson};

/// A dense cell x gene count matrix held in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct CountMatrix {
    counts: Array2<f64>,
}

/// The counts of one batch, `descriptor.cells` x `descriptor.genes`.
#[derive(Debug, Clone, PartialEq)]
pub struct CountBatch {
    /// Rows follow the descriptor's cells, columns its genes.
    pub counts: Array2<f64>,
}

impl CountMatrix {
    /// Wrap an existing cell x gene matrix.
    pub fn new(counts: Array2<f64>) -> Self {
        CountMatrix { counts }
    }

    /// Build from row-major values.
    pub fn from_shape_vec(n_cells: usize, n_genes: usize, values: Vec<f64>) -> Result<Self> {
        ensure!(
            values.len() == n_cells * n_genes,
            "expected {} values for a {n_cells} x {n_genes} matrix, got {}",
            n_cells * n_genes,
            values.len()
        );
        Ok(CountMatrix::new(Array2::from_shape_vec(
            (n_cells, n_genes),
            values,
        )?))
    }

    /// Draw Poisson counts with mean `size_factors[cell] * gene_rates[gene]`.
    pub fn simulate(gene_rates: &[f64], size_factors: &[f64], seed: u64) -> Result<Self> {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let mut counts = Array2::zeros((size_factors.len(), gene_rates.len()));
        for ((cell, gene), value) in counts.indexed_iter_mut() {
            let mean = size_factors[cell] * gene_rates[gene];
            if mean <= 0.0 {
                // Poisson needs a positive mean
                continue;
            }
            *value = Poisson::new(mean)?.sample(&mut rng);
        }
        Ok(CountMatrix::new(counts))
    }

    /// The full matrix.
    pub fn counts(&self) -> &Array2<f64> {
        &self.counts
    }
}

impl BackingData for CountMatrix {
    type Gathered = CountBatch;

    fn n_cells(&self) -> usize {
        self.counts.nrows()
    }

    fn n_genes(&self) -> usize {
        self.counts.ncols()
    }

    fn gather(&self, cells: &[usize], genes: &[usize]) -> Result<CountBatch> {
        if let Some(&cell) = cells.iter().find(|&&c| c >= self.n_cells()) {
            bail!("cell {cell} is out of range for {} cells", self.n_cells());
        }
        if let Some(&gene) = genes.iter().find(|&&g| g >= self.n_genes()) {
            bail!("gene {gene} is out of range for {} genes", self.n_genes());
        }
        let counts = self.counts.select(Axis(0), cells).select(Axis(1), genes);
        Ok(CountBatch { counts })
    }
}
