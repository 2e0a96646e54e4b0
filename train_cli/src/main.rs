//! Fit per-gene Poisson rates to a simulated count matrix, once per
//! cross-validation fold, and write each fold's training trace to disk.

use anyhow::{ensure, Context, Result};
use clap::Parser;
use loader_pool::{Batch, CountBatch, CountMatrix, GatherLoader, LoaderPool};
use log::{info, warn};
use minibatch::{generate_folds, BinSteps, Fold, FoldPlans, PartitionPlan};
use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Gamma, LogNormal};
use serde::Serialize;
use serde_json::json;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use train_params::{OptimizerKind, TrainingParameters};
use trainer::{
    evaluate, Adam, KeyedAccumulatorHook, Optimizer, PoissonLoss, PoissonRateModel, Sgd,
    StopSignal, TrainConfig, TrainerState, TrainingSession,
};

mod logging;

#[derive(Parser, Debug)]
#[clap(name = "train_rates")]
struct Args {
    /// Training parameters. Defaults are used if the file does not exist.
    #[clap(long, default_value = "parameters.toml")]
    params: PathBuf,

    /// Number of simulated cells.
    #[clap(long = "n-cells", default_value_t = 2000)]
    n_cells: usize,

    /// Number of simulated genes.
    #[clap(long = "n-genes", default_value_t = 300)]
    n_genes: usize,

    /// Folds to hold out in turn, comma separated. All folds if omitted.
    #[clap(long, value_delimiter = ',')]
    folds: Vec<usize>,

    /// Number of validation batches scored after training.
    #[clap(long = "n-trace", default_value_t = 5)]
    n_trace: usize,

    /// Replaces the seed from the parameters file.
    #[clap(long)]
    seed: Option<u64>,

    /// Output directory.
    #[clap(long = "out")]
    out_dir: PathBuf,
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| path.display().to_string())?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .with_context(|| path.display().to_string())?;
    Ok(())
}

fn start_pool(
    matrix: &Arc<CountMatrix>,
    n_workers: usize,
    shuffle_on_iter: bool,
    seed: u64,
    plan: PartitionPlan,
) -> Result<LoaderPool<GatherLoader<CountMatrix>>> {
    let mut pool = LoaderPool::new(
        GatherLoader::new,
        Arc::clone(matrix),
        n_workers,
        shuffle_on_iter,
    )?
    .with_shuffle_seed(seed);
    pool.initialize(plan)?;
    Ok(pool)
}

struct Simulation {
    gene_rates: Vec<f64>,
    size_factors: Vec<f64>,
    matrix: Arc<CountMatrix>,
}

fn simulate(n_cells: usize, n_genes: usize, seed: u64) -> Result<Simulation> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let rate = Gamma::new(2.0, 1.5)?;
    let size = LogNormal::new(0.0, 0.3)?;
    let gene_rates: Vec<f64> = (0..n_genes).map(|_| rate.sample(&mut rng)).collect();
    let size_factors: Vec<f64> = (0..n_cells).map(|_| size.sample(&mut rng)).collect();
    let matrix = CountMatrix::simulate(&gene_rates, &size_factors, seed)?;
    Ok(Simulation {
        gene_rates,
        size_factors,
        matrix: Arc::new(matrix),
    })
}

/// Everything shared by the folds of one run.
struct Run<'a> {
    args: &'a Args,
    params: &'a TrainingParameters,
    sim: &'a Simulation,
    seed: u64,
    stop: &'a StopSignal,
}

impl Run<'_> {
    fn out(&self, stem: &str, fold_ix: usize) -> PathBuf {
        self.args.out_dir.join(format!("{stem}_{fold_ix}.json"))
    }

    fn optimizer(&self) -> Box<dyn Optimizer> {
        let lr = self.params.learning_rate;
        match self.params.optimizer {
            OptimizerKind::Adam => Box::new(Adam::new(lr).with_weight_decay(lr / 10.0)),
            OptimizerKind::Sgd => Box::new(Sgd::new(lr)),
        }
    }

    /// Train on one fold with fresh pools and a fresh session. Returns the
    /// state the trainer ended in.
    fn fold(&self, fold_ix: usize, fold: &Fold) -> Result<TrainerState> {
        let params = self.params;
        let genes: Vec<usize> = (0..self.args.n_genes).collect();
        let steps = BinSteps {
            n_cells_step: params.n_cells_step,
            n_genes_step: params.n_genes_step,
        };
        let plans = FoldPlans::build(
            fold,
            &genes,
            self.args.n_genes,
            steps,
            params.permute_genes,
            self.args.n_trace,
            Some(self.seed),
        )?;
        info!(
            "fold {fold_ix}: {} training cells in {} batches, {} validation cells in {} batches",
            fold.cells_train.len(),
            plans.train.len(),
            fold.cells_validation.len(),
            plans.validation.len()
        );

        let model = PoissonRateModel::new(plans.train.n_genes())
            .with_size_factors(self.sim.size_factors.clone())?;
        let n_genes = model.n_genes();
        let train_pool = start_pool(
            &self.sim.matrix,
            params.n_workers_train,
            params.shuffle_on_iter,
            self.seed,
            plans.train,
        )?;
        let validation_pool = start_pool(
            &self.sim.matrix,
            params.n_workers_validation,
            false,
            self.seed,
            plans.validation,
        )?;
        let config = TrainConfig {
            n_epochs: params.n_epochs,
            checkpoint_every_epoch: params.checkpoint_every_epoch,
            optimize_every_step: params.optimize_every_step,
        };
        let mut session = TrainingSession::new(
            model,
            self.optimizer(),
            Box::new(PoissonLoss),
            train_pool,
            validation_pool,
            config,
        )
        .with_stop_signal(self.stop.clone());
        session.add_hook(Box::new(KeyedAccumulatorHook::new(
            "gene_likelihood",
            n_genes,
            |m: &PoissonRateModel, b: &Batch<CountBatch>, o: &Array2<f64>| {
                m.gene_log_likelihood(o, b)
            },
        )));

        let result = session.train();
        write_json(&self.out("hooks", fold_ix), &session.hook_reports())?;
        let trace = match result {
            Ok(trace) => trace,
            Err(err) => {
                write_json(&self.out("trace", fold_ix), &err.trace)?;
                return Err(err).with_context(|| format!("training fold {fold_ix}"));
            }
        };
        write_json(&self.out("trace", fold_ix), &trace)?;
        if let Some(best) = trace.best_checkpoint() {
            info!(
                "fold {fold_ix}: best checkpoint {} (epoch {}), validation loss {:.6}",
                best.checkpoint,
                best.epoch,
                best.validation_loss.unwrap_or(f64::NAN)
            );
        }

        let model = session.into_model();
        let mut trace_pool = start_pool(
            &self.sim.matrix,
            params.n_workers_validation,
            false,
            self.seed,
            plans.validation_trace,
        )?;
        let losses = evaluate(&model, &mut trace_pool, &PoissonLoss)?;
        trace_pool.terminate();
        write_json(&self.out("validation_trace", fold_ix), &losses)?;
        write_json(
            &self.out("rates", fold_ix),
            &json!({
                "simulated": self.sim.gene_rates,
                "fitted": model.rates(),
            }),
        )?;
        Ok(trace.state)
    }
}

fn run(args: Args, stop: StopSignal) -> Result<()> {
    let mut params = TrainingParameters::load(&args.params)?;
    if args.seed.is_some() {
        params.seed = args.seed;
    }
    let seed = params.seed.unwrap_or_else(rand::random);
    info!("using seed {seed}");

    let fold_ixs: Vec<usize> = if args.folds.is_empty() {
        (0..params.n_folds).collect()
    } else {
        args.folds.clone()
    };
    for &fold_ix in &fold_ixs {
        ensure!(
            fold_ix < params.n_folds,
            "fold {fold_ix} does not exist with n_folds = {}",
            params.n_folds
        );
    }
    fs::create_dir_all(&args.out_dir).with_context(|| args.out_dir.display().to_string())?;
    write_json(&args.out_dir.join("parameters.json"), &params)?;

    let sim = simulate(args.n_cells, args.n_genes, seed)?;
    let folds = generate_folds(args.n_cells, params.n_folds, seed)?;
    let run = Run {
        args: &args,
        params: &params,
        sim: &sim,
        seed,
        stop: &stop,
    };
    for (i, &fold_ix) in fold_ixs.iter().enumerate() {
        let state = run.fold(fold_ix, &folds[fold_ix])?;
        if state == TrainerState::Cancelled {
            warn!(
                "interrupted during fold {fold_ix}, skipping {} remaining folds",
                fold_ixs.len() - i - 1
            );
            break;
        }
    }
    info!("wrote results to {}", args.out_dir.display());
    Ok(())
}

fn main() -> Result<()> {
    logging::init_log();
    let stop = StopSignal::new();
    let handler = stop.clone();
    ctrlc::set_handler(move || {
        warn!("interrupted, finishing the current batch");
        handler.request_stop();
    })
    .context("failed to set the Ctrl-C handler")?;
    run(Args::parse(), stop)
}
