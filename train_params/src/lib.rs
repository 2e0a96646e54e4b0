//! Parameters of a minibatch training run, read from `parameters.toml`.
// Warning groups (as of rust 1.55)
#![deny(
    future_incompatible,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2021_compatibility,
    rust_2018_idioms,
    unused
)]

use anyhow::{ensure, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which optimizer updates the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Adam with an L2 penalty of `learning_rate / 10`.
    Adam,
    /// Plain stochastic gradient descent.
    Sgd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingParameters {
    /// Maximum number of cells in one minibatch.
    pub n_cells_step: usize,
    /// Maximum number of genes in one minibatch.
    pub n_genes_step: usize,
    /// Loader threads materializing training batches.
    pub n_workers_train: usize,
    /// Loader threads materializing validation batches.
    pub n_workers_validation: usize,
    pub n_epochs: usize,
    /// Run validation and the checkpoint hooks every this many epochs.
    pub checkpoint_every_epoch: usize,
    /// Number of minibatches whose gradients are summed before one optimizer step.
    pub optimize_every_step: usize,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    /// Reshuffle the training batch order on every pass.
    pub shuffle_on_iter: bool,
    /// Shuffle the order of gene chunks when building the training plan.
    pub permute_genes: bool,
    pub n_folds: usize,
    /// Seed for folds, plans and loader shuffles. Unset means fresh entropy.
    pub seed: Option<u64>,
}

impl Default for TrainingParameters {
    fn default() -> Self {
        TrainingParameters {
            n_cells_step: 100,
            n_genes_step: 50,
            n_workers_train: 20,
            n_workers_validation: 5,
            n_epochs: 50,
            checkpoint_every_epoch: 1,
            optimize_every_step: 1,
            learning_rate: 1e-2,
            optimizer: OptimizerKind::Adam,
            shuffle_on_iter: true,
            permute_genes: false,
            n_folds: 5,
            seed: None,
        }
    }
}

macro_rules! warn_non_default {
    ($params:expr, $defaults:expr, $($field:ident),+ $(,)?) => {
        $(
            if $defaults.$field != $params.$field {
                warn!("using non-default {} = {:?}", stringify!($field), $params.$field);
            }
        )+
    };
}

impl TrainingParameters {
    /// Read parameters from `path`, falling back to the defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(
                "could not find parameters at {}, falling back to defaults",
                path.display()
            );
            return Ok(TrainingParameters::default());
        }
        let s = std::fs::read_to_string(path).with_context(|| path.display().to_string())?;
        TrainingParameters::from_toml_str(&s).with_context(|| path.display().to_string())
    }

    /// Parse and validate a TOML document. Absent keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let params: TrainingParameters = toml::from_str(s)?;
        params.validate()?;
        params.report_overrides();
        Ok(params)
    }

    fn report_overrides(&self) {
        let defaults = TrainingParameters::default();
        warn_non_default!(
            self,
            defaults,
            n_cells_step,
            n_genes_step,
            n_workers_train,
            n_workers_validation,
            n_epochs,
            checkpoint_every_epoch,
            optimize_every_step,
            learning_rate,
            optimizer,
            shuffle_on_iter,
            permute_genes,
            n_folds,
            seed,
        );
    }

    /// Reject values the partitioner, the pools or the trainer cannot work with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.n_cells_step > 0, "n_cells_step must be positive");
        ensure!(self.n_genes_step > 0, "n_genes_step must be positive");
        ensure!(self.n_workers_train > 0, "n_workers_train must be positive");
        ensure!(
            self.n_workers_validation > 0,
            "n_workers_validation must be positive"
        );
        ensure!(
            self.checkpoint_every_epoch > 0,
            "checkpoint_every_epoch must be positive"
        );
        ensure!(
            self.optimize_every_step > 0,
            "optimize_every_step must be positive"
        );
        ensure!(
            self.learning_rate.is_finite() && self.learning_rate > 0.0,
            "learning_rate must be a positive number, got {}",
            self.learning_rate
        );
        ensure!(self.n_folds >= 2, "n_folds must be at least 2");
        Ok(())
    }
}
