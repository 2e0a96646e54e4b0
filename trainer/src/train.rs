use crate::error::{TrainError, TrainErrorKind};
use crate::hooks::CheckpointHook;
use crate::model::{Loss, Model, Optimizer, Parameters};
use crate::trace::{
    BatchLoss, CheckpointRecord, RunningMean, StepRecord, TrainerState, TrainingTrace,
};
use loader_pool::{Loader, LoaderPool};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Schedule of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Number of passes over the training plan.
    pub n_epochs: usize,
    /// Validate and run the hooks after every this many epochs.
    pub checkpoint_every_epoch: usize,
    /// Accumulate gradients over this many batches per optimizer step.
    pub optimize_every_step: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            n_epochs: 50,
            checkpoint_every_epoch: 1,
            optimize_every_step: 1,
        }
    }
}

impl TrainConfig {
    fn validate(&self) -> Result<(), TrainErrorKind> {
        if self.checkpoint_every_epoch == 0 {
            return Err(TrainErrorKind::Config(
                "checkpoint_every_epoch must be positive".to_string(),
            ));
        }
        if self.optimize_every_step == 0 {
            return Err(TrainErrorKind::Config(
                "optimize_every_step must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Asks a running [`train`] call to stop after the batch it is working on.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// A signal that has not been raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Every clone sees it; it cannot be lowered again.
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether any clone has raised the signal.
    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn fmt_loss(loss: Option<f64>) -> String {
    loss.map_or_else(|| "n/a".to_string(), |l| format!("{l:.6}"))
}

fn model_error(batch: usize) -> impl FnOnce(anyhow::Error) -> TrainErrorKind {
    move |source| TrainErrorKind::Model { batch, source }
}

// Mutable bookkeeping of one train call.
#[derive(Default)]
struct Progress {
    trace: TrainingTrace,
    checkpoint: usize,
    n_steps: usize,
    since_checkpoint: RunningMean,
}

impl Progress {
    fn commit<O: Optimizer + ?Sized>(&mut self, params: &mut Parameters, optimizer: &mut O) {
        optimizer.step(params);
        optimizer.zero_accumulated_gradient(params);
        self.n_steps += 1;
    }
}

/// Train `model` on the batches of `train_pool` for `config.n_epochs` epochs.
///
/// Both pools must have been initialized with their plans. Every
/// `checkpoint_every_epoch` epochs the validation pool is drained once: its
/// losses go into the trace and every hook sees every validation batch.
/// Training stops early, with a partial trace in state
/// [`TrainerState::Cancelled`], once `stop` is raised; the batch in flight is
/// finished and its gradient committed. A stop raised during validation
/// abandons that checkpoint, unless it came on the last validation batch, in
/// which case the checkpoint completes first.
///
/// Both pools are terminated before this returns, whatever the outcome. On
/// failure the error carries the trace up to the failure and the index of
/// the last completed checkpoint.
#[allow(clippy::too_many_arguments)]
pub fn train<M, P, L, V, O, Lo>(
    model: &mut M,
    mut train_pool: LoaderPool<L>,
    mut validation_pool: LoaderPool<V>,
    optimizer: &mut O,
    loss: &Lo,
    config: &TrainConfig,
    hooks: &mut [&mut dyn CheckpointHook<M, P>],
    stop: &StopSignal,
) -> Result<TrainingTrace, TrainError>
where
    M: Model<P>,
    L: Loader<Payload = P>,
    V: Loader<Payload = P>,
    O: Optimizer + ?Sized,
    Lo: Loss<M::Output, P> + ?Sized,
{
    let mut progress = Progress::default();
    let result = run_epochs(
        model,
        &mut train_pool,
        &mut validation_pool,
        optimizer,
        loss,
        config,
        hooks,
        stop,
        &mut progress,
    );
    train_pool.terminate();
    validation_pool.terminate();

    let mut trace = progress.trace;
    match result {
        Ok(()) => Ok(trace),
        Err(kind) => {
            trace.state = TrainerState::Failed;
            let err = TrainError::new(kind, trace);
            error!("{err}: {}", err.cause_chain());
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_epochs<M, P, L, V, O, Lo>(
    model: &mut M,
    train_pool: &mut LoaderPool<L>,
    validation_pool: &mut LoaderPool<V>,
    optimizer: &mut O,
    loss: &Lo,
    config: &TrainConfig,
    hooks: &mut [&mut dyn CheckpointHook<M, P>],
    stop: &StopSignal,
    progress: &mut Progress,
) -> Result<(), TrainErrorKind>
where
    M: Model<P>,
    L: Loader<Payload = P>,
    V: Loader<Payload = P>,
    O: Optimizer + ?Sized,
    Lo: Loss<M::Output, P> + ?Sized,
{
    config.validate()?;
    progress.trace.state = TrainerState::Running;

    for epoch in 0..config.n_epochs {
        if stop.is_stop_requested() {
            cancel(progress, epoch);
            return Ok(());
        }
        if !train_pool.is_pristine() {
            train_pool.restart()?;
        }
        debug!(
            "epoch {epoch}: {} training batches on {} workers",
            train_pool.remaining(),
            train_pool.n_workers()
        );

        optimizer.zero_accumulated_gradient(model.parameters_mut());
        let mut pending = 0;
        let mut step = 0;
        while let Some(batch) = train_pool.next_batch()? {
            let output = model
                .forward(&batch)
                .map_err(model_error(batch.descriptor.seq))?;
            let value = loss.loss(&output, &batch);
            let grad = loss.gradient(&output, &batch);
            model
                .backward(&batch, &output, &grad)
                .map_err(model_error(batch.descriptor.seq))?;
            pending += 1;

            progress.trace.train_steps.push(StepRecord {
                epoch,
                step,
                checkpoint: progress.checkpoint,
                batch: batch.descriptor.seq,
                loss: value,
            });
            progress.since_checkpoint.record(value);
            step += 1;

            if pending == config.optimize_every_step {
                progress.commit(model.parameters_mut(), optimizer);
                pending = 0;
            }
            if stop.is_stop_requested() {
                if pending > 0 {
                    progress.commit(model.parameters_mut(), optimizer);
                }
                cancel(progress, epoch);
                return Ok(());
            }
        }
        // leftover batches of an incomplete accumulation window
        if pending > 0 {
            progress.commit(model.parameters_mut(), optimizer);
        }

        if (epoch + 1) % config.checkpoint_every_epoch == 0
            && !checkpoint(model, validation_pool, loss, hooks, stop, progress, epoch)?
        {
            cancel(progress, epoch);
            return Ok(());
        }
        // raised while the last validation batch was being scored
        if stop.is_stop_requested() {
            cancel(progress, epoch);
            return Ok(());
        }
    }
    progress.trace.state = TrainerState::Finished;
    info!(
        "finished training: {} epochs, {} optimizer steps, {} checkpoints",
        config.n_epochs,
        progress.n_steps,
        progress.trace.checkpoints.len()
    );
    Ok(())
}

fn cancel(progress: &mut Progress, epoch: usize) {
    warn!(
        "training stopped in epoch {epoch} after {} optimizer steps",
        progress.n_steps
    );
    progress.trace.state = TrainerState::Cancelled;
}

// Returns false if a stop request abandoned the checkpoint. A stop raised
// on the final validation batch lets the checkpoint complete.
fn checkpoint<M, P, V, Lo>(
    model: &mut M,
    validation_pool: &mut LoaderPool<V>,
    loss: &Lo,
    hooks: &mut [&mut dyn CheckpointHook<M, P>],
    stop: &StopSignal,
    progress: &mut Progress,
    epoch: usize,
) -> Result<bool, TrainErrorKind>
where
    M: Model<P>,
    V: Loader<Payload = P>,
    Lo: Loss<M::Output, P> + ?Sized,
{
    let index = progress.checkpoint;
    progress.trace.state = TrainerState::Checkpointing;
    for hook in hooks.iter_mut() {
        hook.start();
    }
    if !validation_pool.is_pristine() {
        validation_pool.restart()?;
    }

    let mut validation = RunningMean::default();
    let mut step = 0;
    while let Some(batch) = validation_pool.next_batch()? {
        let output = model
            .forward(&batch)
            .map_err(model_error(batch.descriptor.seq))?;
        let value = loss.loss(&output, &batch);
        validation.record(value);
        progress.trace.validation_steps.push(StepRecord {
            epoch,
            step,
            checkpoint: index,
            batch: batch.descriptor.seq,
            loss: value,
        });
        step += 1;

        for hook in hooks.iter_mut() {
            hook.run_individual(model, &batch, &output)
                .map_err(|source| TrainErrorKind::Hook {
                    hook: hook.name().to_string(),
                    source,
                })?;
        }
        // A stop on the last batch still completes the checkpoint.
        if stop.is_stop_requested() && validation_pool.remaining() > 0 {
            progress
                .trace
                .validation_steps
                .retain(|s| s.checkpoint != index);
            return Ok(false);
        }
    }
    for hook in hooks.iter_mut() {
        hook.finish();
    }

    let record = CheckpointRecord {
        checkpoint: index,
        epoch,
        n_steps: progress.n_steps,
        train_loss: progress.since_checkpoint.mean(),
        validation_loss: validation.mean(),
    };
    info!(
        "checkpoint {index} (epoch {epoch}): train loss {}, validation loss {}",
        fmt_loss(record.train_loss),
        fmt_loss(record.validation_loss)
    );
    progress.trace.checkpoints.push(record);
    progress.checkpoint += 1;
    progress.since_checkpoint = RunningMean::default();
    progress.trace.state = TrainerState::Running;
    Ok(true)
}

/// Run `model` over one pass of `pool` without touching its parameters.
/// Losses are returned in batch sequence order. The pool stays usable.
pub fn evaluate<M, P, L, Lo>(
    model: &M,
    pool: &mut LoaderPool<L>,
    loss: &Lo,
) -> Result<Vec<BatchLoss>, TrainErrorKind>
where
    M: Model<P>,
    L: Loader<Payload = P>,
    Lo: Loss<M::Output, P> + ?Sized,
{
    if !pool.is_pristine() {
        pool.restart()?;
    }
    let mut losses = Vec::with_capacity(pool.remaining());
    while let Some(batch) = pool.next_batch()? {
        let output = model
            .forward(&batch)
            .map_err(model_error(batch.descriptor.seq))?;
        losses.push(BatchLoss {
            batch: batch.descriptor.seq,
            loss: loss.loss(&output, &batch),
        });
    }
    losses.sort_by_key(|l| l.batch);
    Ok(losses)
}
