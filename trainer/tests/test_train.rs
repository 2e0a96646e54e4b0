use anyhow::{bail, Result};
use loader_pool::{
    BackingData, Batch, CountBatch, CountMatrix, GatherLoader, Loader, LoaderPool, PoolError,
};
use minibatch::{create_bins_ordered, BatchDescriptor, PartitionPlan};
use ndarray::Array2;
use pretty_assertions::assert_eq;
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use trainer::{
    evaluate, train, Adam, CheckpointHook, KeyedAccumulatorHook, Loss, Model, Optimizer, Parameters,
    PoissonLoss, PoissonRateModel, StopSignal, TrainConfig, TrainErrorKind, TrainerState,
    TrainingSession, TrainingTrace,
};

const N_GENES: usize = 4;

type Hooks<'a> = Vec<&'a mut dyn CheckpointHook<PoissonRateModel, CountBatch>>;

fn matrix() -> Arc<CountMatrix> {
    let rates: Vec<f64> = (0..N_GENES).map(|g| 1.0 + 2.0 * g as f64).collect();
    Arc::new(CountMatrix::simulate(&rates, &[1.0; 40], 7).unwrap())
}

// 30 training cells in chunks of 3, all genes at once: 10 batches
fn train_plan() -> PartitionPlan {
    let cells: Vec<usize> = (0..30).collect();
    let genes: Vec<usize> = (0..N_GENES).collect();
    create_bins_ordered(&cells, &genes, N_GENES, 3, N_GENES).unwrap()
}

// 10 validation cells, 2 x 2 batches
fn validation_plan() -> PartitionPlan {
    let cells: Vec<usize> = (30..40).collect();
    let genes: Vec<usize> = (0..N_GENES).collect();
    create_bins_ordered(&cells, &genes, N_GENES, 5, 2).unwrap()
}

fn gather_pool(
    data: &Arc<CountMatrix>,
    plan: PartitionPlan,
) -> LoaderPool<GatherLoader<CountMatrix>> {
    let mut pool = LoaderPool::new(GatherLoader::new, Arc::clone(data), 3, true)
        .unwrap()
        .with_shuffle_seed(11);
    pool.initialize(plan).unwrap();
    pool
}

fn config(n_epochs: usize) -> TrainConfig {
    TrainConfig {
        n_epochs,
        checkpoint_every_epoch: 1,
        optimize_every_step: 1,
    }
}

/// Fails the `fail_on_hit`-th time descriptor `fail_seq` is loaded.
struct Flaky {
    data: Arc<CountMatrix>,
    fail_seq: usize,
    fail_on_hit: usize,
    hits: AtomicUsize,
}

struct FlakyLoader(Arc<Flaky>);

impl Loader for FlakyLoader {
    type Payload = CountBatch;

    fn load(&mut self, descriptor: &BatchDescriptor) -> Result<CountBatch> {
        let flaky = &self.0;
        if descriptor.seq == flaky.fail_seq
            && flaky.hits.fetch_add(1, Ordering::SeqCst) + 1 == flaky.fail_on_hit
        {
            bail!("disk went away");
        }
        flaky.data.gather(&descriptor.cells, &descriptor.genes)
    }
}

#[test]
fn test_materialization_failure_keeps_completed_checkpoints() {
    let data = matrix();
    let flaky = Arc::new(Flaky {
        data: Arc::clone(&data),
        fail_seq: 7,
        fail_on_hit: 3,
        hits: AtomicUsize::new(0),
    });
    let mut train_pool = LoaderPool::new(
        |f: &Arc<Flaky>| Ok(FlakyLoader(Arc::clone(f))),
        Arc::clone(&flaky),
        2,
        false,
    )
    .unwrap();
    train_pool.initialize(train_plan()).unwrap();
    let validation_pool = gather_pool(&data, validation_plan());

    let mut model = PoissonRateModel::new(N_GENES);
    let mut optimizer = Adam::new(0.05);
    let err = train(
        &mut model,
        train_pool,
        validation_pool,
        &mut optimizer,
        &PoissonLoss,
        &config(5),
        &mut [],
        &StopSignal::new(),
    )
    .unwrap_err();

    assert!(matches!(
        err.kind,
        TrainErrorKind::Pool(PoolError::BatchMaterialization { .. })
    ));
    assert_eq!(err.descriptor().map(|d| d.seq), Some(7));
    assert_eq!(err.last_checkpoint, Some(1));
    assert_eq!(err.trace.checkpoints.len(), 2);
    assert_eq!(err.trace.state, TrainerState::Failed);
    assert!(err.trace.train_steps.iter().all(|s| s.epoch < 3));

    // every worker has been joined and has released its loader
    assert_eq!(Arc::strong_count(&flaky), 1);
    drop(flaky);
    assert_eq!(Arc::strong_count(&data), 1);
}

#[test]
fn test_one_checkpoint_per_epoch() {
    let data = matrix();
    let mut model = PoissonRateModel::new(N_GENES);
    let trace = train(
        &mut model,
        gather_pool(&data, train_plan()),
        gather_pool(&data, validation_plan()),
        &mut Adam::new(0.05),
        &PoissonLoss,
        &config(3),
        &mut [],
        &StopSignal::new(),
    )
    .unwrap();

    assert_eq!(trace.state, TrainerState::Finished);
    assert_eq!(
        trace.checkpoints.iter().map(|c| c.checkpoint).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(
        trace.checkpoints.iter().map(|c| c.n_steps).collect::<Vec<_>>(),
        vec![10, 20, 30]
    );
    assert_eq!(trace.train_steps.len(), 30);
    assert_eq!(trace.validation_steps.len(), 12);

    // each pass delivers every descriptor once
    for epoch in 0..3 {
        let mut seen: Vec<usize> = trace
            .train_steps
            .iter()
            .filter(|s| s.epoch == epoch)
            .map(|s| s.batch)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    let by_checkpoint = trace.validation_loss_by_checkpoint();
    for record in &trace.checkpoints {
        let mean = by_checkpoint[&record.checkpoint];
        assert!((record.validation_loss.unwrap() - mean).abs() < 1e-12);
    }
    assert_eq!(Arc::strong_count(&data), 1);
}

#[test]
fn test_checkpoint_every_other_epoch() {
    let data = matrix();
    let trace = train(
        &mut PoissonRateModel::new(N_GENES),
        gather_pool(&data, train_plan()),
        gather_pool(&data, validation_plan()),
        &mut Adam::new(0.05),
        &PoissonLoss,
        &TrainConfig {
            n_epochs: 5,
            checkpoint_every_epoch: 2,
            optimize_every_step: 1,
        },
        &mut [],
        &StopSignal::new(),
    )
    .unwrap();
    assert_eq!(
        trace.checkpoints.iter().map(|c| c.epoch).collect::<Vec<_>>(),
        vec![1, 3]
    );
    // steps of the last epoch count towards a checkpoint that never ran
    assert_eq!(trace.train_loss_by_checkpoint().len(), 3);
}

#[test]
fn test_gene_hook_matches_full_validation_block() {
    let data = matrix();
    let mut hook = KeyedAccumulatorHook::new(
        "gene_likelihood",
        N_GENES,
        |m: &PoissonRateModel, b: &Batch<CountBatch>, o: &Array2<f64>| {
            m.gene_log_likelihood(o, b)
        },
    );
    let mut model = PoissonRateModel::new(N_GENES);
    {
        let mut hooks: Hooks<'_> = vec![&mut hook];
        train(
            &mut model,
            gather_pool(&data, train_plan()),
            gather_pool(&data, validation_plan()),
            &mut Adam::new(0.05),
            &PoissonLoss,
            &config(2),
            &mut hooks,
            &StopSignal::new(),
        )
        .unwrap();
    }
    assert_eq!(hook.history().len(), 2);

    let cells: Vec<usize> = (30..40).collect();
    let genes: Vec<usize> = (0..N_GENES).collect();
    let full = Batch {
        data: data.gather(&cells, &genes).unwrap(),
        descriptor: Arc::new(BatchDescriptor {
            seq: 0,
            cells,
            genes,
        }),
    };
    let output = model.forward(&full).unwrap();
    let expected = model.gene_log_likelihood(&output, &full);
    let latest = hook.latest().unwrap();
    for (gene, ll) in expected {
        assert!((latest[gene] - ll).abs() < 1e-9, "gene {gene}: {} vs {ll}", latest[gene]);
    }
}

/// Raises the stop signal from inside the training loop after `after` losses.
struct StoppingLoss {
    stop: StopSignal,
    after: usize,
    calls: Cell<usize>,
}

impl Loss<Array2<f64>, CountBatch> for StoppingLoss {
    fn loss(&self, output: &Array2<f64>, batch: &Batch<CountBatch>) -> f64 {
        self.calls.set(self.calls.get() + 1);
        if self.calls.get() == self.after {
            self.stop.request_stop();
        }
        PoissonLoss.loss(output, batch)
    }

    fn gradient(&self, output: &Array2<f64>, batch: &Batch<CountBatch>) -> Array2<f64> {
        PoissonLoss.gradient(output, batch)
    }
}

#[test]
fn test_stop_finishes_current_batch() {
    let data = matrix();
    let stop = StopSignal::new();
    let loss = StoppingLoss {
        stop: stop.clone(),
        after: 4,
        calls: Cell::new(0),
    };
    let mut model = PoissonRateModel::new(N_GENES);
    let trace = train(
        &mut model,
        gather_pool(&data, train_plan()),
        gather_pool(&data, validation_plan()),
        &mut Adam::new(0.05),
        &loss,
        &TrainConfig {
            n_epochs: 3,
            checkpoint_every_epoch: 1,
            optimize_every_step: 3,
        },
        &mut [],
        &stop,
    )
    .unwrap();

    assert_eq!(trace.state, TrainerState::Cancelled);
    assert_eq!(trace.train_steps.len(), 4);
    assert!(trace.checkpoints.is_empty());
    // the fourth batch's gradient was committed, not left pending
    assert!(model.get_parameters().grads.iter().all(|&g| g == 0.0));
    assert_eq!(Arc::strong_count(&data), 1);
}

/// Requests a stop when the first checkpoint finishes.
struct StopAfterCheckpoint(StopSignal);

impl CheckpointHook<PoissonRateModel, CountBatch> for StopAfterCheckpoint {
    fn start(&mut self) {}

    fn run_individual(
        &mut self,
        _model: &PoissonRateModel,
        _batch: &Batch<CountBatch>,
        _output: &Array2<f64>,
    ) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) {
        self.0.request_stop();
    }
}

#[test]
fn test_stop_between_epochs() {
    let data = matrix();
    let stop = StopSignal::new();
    let mut hook = StopAfterCheckpoint(stop.clone());
    let mut hooks: Hooks<'_> = vec![&mut hook];
    let trace = train(
        &mut PoissonRateModel::new(N_GENES),
        gather_pool(&data, train_plan()),
        gather_pool(&data, validation_plan()),
        &mut Adam::new(0.05),
        &PoissonLoss,
        &config(4),
        &mut hooks,
        &stop,
    )
    .unwrap();
    assert_eq!(trace.state, TrainerState::Cancelled);
    assert_eq!(trace.checkpoints.len(), 1);
    assert_eq!(trace.train_steps.len(), 10);
}

/// Requests a stop while the `nth` validation batch of a checkpoint is scored.
struct StopOnValidationBatch {
    stop: StopSignal,
    nth: usize,
    seen: usize,
}

impl CheckpointHook<PoissonRateModel, CountBatch> for StopOnValidationBatch {
    fn start(&mut self) {
        self.seen = 0;
    }

    fn run_individual(
        &mut self,
        _model: &PoissonRateModel,
        _batch: &Batch<CountBatch>,
        _output: &Array2<f64>,
    ) -> Result<()> {
        self.seen += 1;
        if self.seen == self.nth {
            self.stop.request_stop();
        }
        Ok(())
    }

    fn finish(&mut self) {}
}

fn train_until_validation_stop(nth: usize) -> (TrainingTrace, Vec<Vec<f64>>) {
    let data = matrix();
    let stop = StopSignal::new();
    let mut stopper = StopOnValidationBatch {
        stop: stop.clone(),
        nth,
        seen: 0,
    };
    let mut genes = KeyedAccumulatorHook::new(
        "gene_likelihood",
        N_GENES,
        |m: &PoissonRateModel, b: &Batch<CountBatch>, o: &Array2<f64>| {
            m.gene_log_likelihood(o, b)
        },
    );
    let trace = {
        let mut hooks: Hooks<'_> = vec![&mut stopper, &mut genes];
        train(
            &mut PoissonRateModel::new(N_GENES),
            gather_pool(&data, train_plan()),
            gather_pool(&data, validation_plan()),
            &mut Adam::new(0.05),
            &PoissonLoss,
            &config(3),
            &mut hooks,
            &stop,
        )
        .unwrap()
    };
    assert_eq!(Arc::strong_count(&data), 1);
    (trace, genes.history().to_vec())
}

#[test]
fn test_stop_mid_validation_abandons_checkpoint() {
    let (trace, history) = train_until_validation_stop(2);
    assert_eq!(trace.state, TrainerState::Cancelled);
    assert_eq!(trace.train_steps.len(), 10);
    assert!(trace.checkpoints.is_empty());
    assert!(trace.validation_steps.is_empty());
    assert!(history.is_empty());
}

#[test]
fn test_stop_on_last_validation_batch_keeps_checkpoint() {
    // the validation plan has four batches
    let (trace, history) = train_until_validation_stop(4);
    assert_eq!(trace.state, TrainerState::Cancelled);
    assert_eq!(trace.train_steps.len(), 10);
    assert_eq!(trace.checkpoints.len(), 1);
    assert_eq!(trace.validation_steps.len(), 4);
    assert_eq!(trace.last_checkpoint(), Some(0));
    assert!(trace.checkpoints[0].validation_loss.is_some());
    assert_eq!(history.len(), 1);
}

/// Counts optimizer steps without changing anything.
#[derive(Default)]
struct CountingOptimizer {
    steps: usize,
    batches_per_step: Vec<usize>,
}

impl Optimizer for CountingOptimizer {
    fn step(&mut self, params: &mut Parameters) {
        self.steps += 1;
        // the gradient of the test loss below is one per batch
        self.batches_per_step.push(params.grads[0].round() as usize);
    }
}

/// Loss whose gradient makes every batch add exactly one to the first
/// parameter's gradient.
struct UnitLoss;

impl Loss<Array2<f64>, CountBatch> for UnitLoss {
    fn loss(&self, _output: &Array2<f64>, _batch: &Batch<CountBatch>) -> f64 {
        1.0
    }

    fn gradient(&self, output: &Array2<f64>, _batch: &Batch<CountBatch>) -> Array2<f64> {
        // d mu / d theta = mu, so 1 / (mu * n) summed over n entries gives 1
        let n = output.len() as f64;
        output.mapv(|mu| 1.0 / (mu * n))
    }
}

#[test]
fn test_gradient_accumulation() {
    let data = matrix();
    // single gene so every batch touches parameter 0
    let cells: Vec<usize> = (0..30).collect();
    let plan = create_bins_ordered(&cells, &[0], N_GENES, 3, 1).unwrap();
    let mut optimizer = CountingOptimizer::default();
    let trace = train(
        &mut PoissonRateModel::new(N_GENES),
        gather_pool(&data, plan),
        gather_pool(&data, validation_plan()),
        &mut optimizer,
        &UnitLoss,
        &TrainConfig {
            n_epochs: 2,
            checkpoint_every_epoch: 1,
            optimize_every_step: 4,
        },
        &mut [],
        &StopSignal::new(),
    )
    .unwrap();

    assert_eq!(optimizer.steps, 6);
    assert_eq!(optimizer.batches_per_step, vec![4, 4, 2, 4, 4, 2]);
    assert_eq!(trace.checkpoints[1].n_steps, 6);
}

#[test]
fn test_invalid_config_still_terminates_pools() {
    let data = matrix();
    let err = train(
        &mut PoissonRateModel::new(N_GENES),
        gather_pool(&data, train_plan()),
        gather_pool(&data, validation_plan()),
        &mut Adam::new(0.05),
        &PoissonLoss,
        &TrainConfig {
            n_epochs: 1,
            checkpoint_every_epoch: 0,
            optimize_every_step: 1,
        },
        &mut [],
        &StopSignal::new(),
    )
    .unwrap_err();
    assert!(matches!(err.kind, TrainErrorKind::Config(_)));
    assert_eq!(err.last_checkpoint, None);
    assert_eq!(Arc::strong_count(&data), 1);
}

#[test]
fn test_uninitialized_pool_is_a_lifecycle_error() {
    let data = matrix();
    let train_pool = LoaderPool::new(GatherLoader::new, Arc::clone(&data), 2, false).unwrap();
    let err = train(
        &mut PoissonRateModel::new(N_GENES),
        train_pool,
        gather_pool(&data, validation_plan()),
        &mut Adam::new(0.05),
        &PoissonLoss,
        &config(1),
        &mut [],
        &StopSignal::new(),
    )
    .unwrap_err();
    assert!(matches!(
        err.kind,
        TrainErrorKind::Pool(PoolError::Lifecycle { .. })
    ));
}

#[test]
fn test_evaluate_is_repeatable() {
    let data = matrix();
    let mut model = PoissonRateModel::new(N_GENES);
    model.parameters_mut().values = vec![0.0, 1.0, 1.5, 2.0];
    let mut pool = gather_pool(&data, validation_plan());

    let first = evaluate(&model, &mut pool, &PoissonLoss).unwrap();
    let second = evaluate(&model, &mut pool, &PoissonLoss).unwrap();
    assert_eq!(first.iter().map(|l| l.batch).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    assert_eq!(first, second);
    pool.terminate();
}

#[test]
fn test_session_trains_once() {
    let data = matrix();
    let mut session = TrainingSession::new(
        PoissonRateModel::new(N_GENES),
        Box::new(Adam::new(0.05)),
        Box::new(PoissonLoss),
        gather_pool(&data, train_plan()),
        gather_pool(&data, validation_plan()),
        config(2),
    );
    session.add_hook(Box::new(KeyedAccumulatorHook::new(
        "gene_likelihood",
        N_GENES,
        |m: &PoissonRateModel, b: &Batch<CountBatch>, o: &Array2<f64>| {
            m.gene_log_likelihood(o, b)
        },
    )));

    let trace = session.train().unwrap();
    assert_eq!(trace.checkpoints.len(), 2);
    let reports = session.hook_reports();
    assert_eq!(
        reports["gene_likelihood"]["checkpoints"].as_array().map(Vec::len),
        Some(2)
    );

    let err = session.train().unwrap_err();
    assert!(matches!(err.kind, TrainErrorKind::Config(_)));

    // training moved the rates towards the simulated ones
    let rates = session.model().rates();
    assert!(rates[3] > rates[0]);
    assert_eq!(session.into_model().rates(), rates);
}

#[test]
fn test_session_stopped_from_another_thread() {
    let data = matrix();
    let mut session = TrainingSession::new(
        PoissonRateModel::new(N_GENES),
        Box::new(Adam::new(0.05)),
        Box::new(PoissonLoss),
        gather_pool(&data, train_plan()),
        gather_pool(&data, validation_plan()),
        config(3),
    );
    let stop = session.stop_signal();
    std::thread::spawn(move || stop.request_stop())
        .join()
        .unwrap();

    let trace = session.train().unwrap();
    assert_eq!(trace.state, TrainerState::Cancelled);
    assert!(trace.train_steps.is_empty());
    assert!(trace.checkpoints.is_empty());
    // untouched parameters: every rate is still exp(0)
    assert!(session.model().rates().iter().all(|&r| r == 1.0));
    assert_eq!(Arc::strong_count(&data), 1);
}

#[test]
fn test_shared_stop_signal_reaches_session() {
    let data = matrix();
    let stop = StopSignal::new();
    let mut session = TrainingSession::new(
        PoissonRateModel::new(N_GENES),
        Box::new(Adam::new(0.05)),
        Box::new(PoissonLoss),
        gather_pool(&data, train_plan()),
        gather_pool(&data, validation_plan()),
        config(3),
    )
    .with_stop_signal(stop.clone());
    assert!(!session.stop_signal().is_stop_requested());

    stop.request_stop();
    assert!(session.stop_signal().is_stop_requested());
    let trace = session.train().unwrap();
    assert_eq!(trace.state, TrainerState::Cancelled);
    assert!(trace.train_steps.is_empty());
}
