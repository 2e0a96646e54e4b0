//! Per-gene Poisson rate model over a count matrix.
//!
//! The expected count of gene `g` in cell `c` is `s_c * exp(theta_g)`, with
//! fixed size factors `s_c` (1 when absent) and one trainable log rate per
//! gene.

use crate::model::{Loss, Model, Parameters};
use anyhow::{bail, ensure, Result};
use loader_pool::{Batch, CountBatch};
use ndarray::{Array2, Zip};
use statrs::function::gamma::ln_gamma;

fn poisson_log_likelihood(y: f64, mu: f64) -> f64 {
    y * mu.ln() - mu - ln_gamma(y + 1.0)
}

/// One log rate per gene, see the module docs.
#[derive(Debug, Clone, PartialEq)]
pub struct PoissonRateModel {
    n_genes: usize,
    size_factors: Option<Vec<f64>>,
    params: Parameters,
}

impl PoissonRateModel {
    /// All genes start at rate 1.
    pub fn new(n_genes: usize) -> Self {
        PoissonRateModel {
            n_genes,
            size_factors: None,
            params: Parameters::filled(n_genes, 0.0),
        }
    }

    /// Scale every cell's expected counts by its size factor. Indexed by cell.
    pub fn with_size_factors(mut self, size_factors: Vec<f64>) -> Result<Self> {
        ensure!(
            size_factors.iter().all(|&s| s.is_finite() && s > 0.0),
            "size factors must be positive"
        );
        self.size_factors = Some(size_factors);
        Ok(self)
    }

    /// Number of genes, and of parameters.
    pub fn n_genes(&self) -> usize {
        self.n_genes
    }

    /// Current rate of every gene, at size factor 1.
    pub fn rates(&self) -> Vec<f64> {
        self.params.values.iter().map(|theta| theta.exp()).collect()
    }

    fn size_factor(&self, cell: usize) -> Result<f64> {
        match &self.size_factors {
            None => Ok(1.0),
            Some(factors) => match factors.get(cell) {
                Some(&s) => Ok(s),
                None => bail!("no size factor for cell {cell}"),
            },
        }
    }

    /// Log-likelihood of the batch's counts summed over cells, keyed by gene
    /// index. `output` must come from [`Model::forward`] on the same batch.
    pub fn gene_log_likelihood(
        &self,
        output: &Array2<f64>,
        batch: &Batch<CountBatch>,
    ) -> Vec<(usize, f64)> {
        batch
            .descriptor
            .genes
            .iter()
            .enumerate()
            .map(|(j, &gene)| {
                let ll = Zip::from(batch.data.counts.column(j))
                    .and(output.column(j))
                    .fold(0.0, |acc, &y, &mu| acc + poisson_log_likelihood(y, mu));
                (gene, ll)
            })
            .collect()
    }
}

impl Model<CountBatch> for PoissonRateModel {
    /// Expected counts, shaped like the batch.
    type Output = Array2<f64>;

    fn forward(&self, batch: &Batch<CountBatch>) -> Result<Array2<f64>> {
        let d = &batch.descriptor;
        if let Some(&gene) = d.genes.iter().find(|&&g| g >= self.n_genes) {
            bail!("gene {gene} is out of range for a model of {} genes", self.n_genes);
        }
        let sizes = d
            .cells
            .iter()
            .map(|&cell| self.size_factor(cell))
            .collect::<Result<Vec<_>>>()?;
        Ok(Array2::from_shape_fn((d.n_cells(), d.n_genes()), |(i, j)| {
            sizes[i] * self.params.values[d.genes[j]].exp()
        }))
    }

    fn backward(
        &mut self,
        batch: &Batch<CountBatch>,
        output: &Array2<f64>,
        output_grad: &Array2<f64>,
    ) -> Result<()> {
        ensure!(
            output.dim() == output_grad.dim(),
            "output is {:?} but its gradient is {:?}",
            output.dim(),
            output_grad.dim()
        );
        for (j, &gene) in batch.descriptor.genes.iter().enumerate() {
            // d mu / d theta = mu
            let grad = Zip::from(output.column(j))
                .and(output_grad.column(j))
                .fold(0.0, |acc, &mu, &g| acc + g * mu);
            self.params.grads[gene] += grad;
        }
        Ok(())
    }

    fn get_parameters(&self) -> &Parameters {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }
}

/// Mean Poisson negative log-likelihood over the entries of a batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoissonLoss;

impl Loss<Array2<f64>, CountBatch> for PoissonLoss {
    fn loss(&self, output: &Array2<f64>, batch: &Batch<CountBatch>) -> f64 {
        let n = output.len() as f64;
        let ll = Zip::from(&batch.data.counts)
            .and(output)
            .fold(0.0, |acc, &y, &mu| acc + poisson_log_likelihood(y, mu));
        -ll / n
    }

    fn gradient(&self, output: &Array2<f64>, batch: &Batch<CountBatch>) -> Array2<f64> {
        let n = output.len() as f64;
        Zip::from(&batch.data.counts)
            .and(output)
            .map_collect(|&y, &mu| (1.0 - y / mu) / n)
    }
}
